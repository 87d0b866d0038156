use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

mod ops;

/// Implements `BlobOp` by listing every field marked `#[blob_op]` (in declaration order) as the op's I/O.
#[proc_macro_derive(BlobOp, attributes(blob_op))]
pub fn derive_blob_op(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let expanded = ops::derive_blob_op(input);
    expanded.into()
}
