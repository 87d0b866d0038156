use proc_macro2::TokenStream;
use quote::quote;
use syn::{
    DeriveInput, Fields, LitStr, Path, Token, WherePredicate, punctuated::Punctuated,
    spanned::Spanned,
};

macro_rules! bail {
    ($span:expr, $message:expr) => {
        return syn::Error::new($span, $message).to_compile_error()
    };
}

pub fn derive_blob_op(input: DeriveInput) -> TokenStream {
    // retrieve struct field information
    let fields = match &input.data {
        syn::Data::Struct(data_struct) => &data_struct.fields,
        _ => bail!(input.span(), "`BlobOp` can only be derived for structs"),
    };

    // only named structs carry enough information to pick the io fields
    let fields_named = match fields {
        Fields::Named(fields_named) => fields_named,
        _ => bail!(
            fields.span(),
            "`BlobOp` can only be derived for structs with named fields"
        ),
    };

    // collect fields with #[blob_op] attribute, keeping declaration order
    let io_fields: Vec<_> = fields_named
        .named
        .iter()
        .filter(|f| f.attrs.iter().any(|a| a.path().is_ident("blob_op")))
        .filter_map(|f| f.ident.as_ref())
        .collect();

    if io_fields.is_empty() {
        bail!(
            fields_named.span(),
            "no field marked with #[blob_op] attribute"
        );
    }

    let name = input.ident;

    // parse blob_op attributes on the container
    let mut crate_name = None;
    let mut user_bounds = Punctuated::<WherePredicate, Token![,]>::new();
    for attr in &input.attrs {
        if !attr.path().is_ident("blob_op") {
            continue;
        }

        let result = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("crate") {
                let value = meta.value()?;
                let s: LitStr = value.parse()?;
                crate_name = Some(s.parse::<Path>()?);
                Ok(())
            } else if meta.path.is_ident("bound") {
                let value = meta.value()?;
                let s: LitStr = value.parse()?;
                let predicates =
                    s.parse_with(Punctuated::<WherePredicate, Token![,]>::parse_terminated)?;
                user_bounds.extend(predicates);
                Ok(())
            } else {
                Err(meta.error("unexpected attribute; supported are `crate` and `bound`"))
            }
        });

        if let Err(err) = result {
            return err.to_compile_error();
        }
    }
    // determine the base path for trait implementation
    let base_path = match crate_name {
        Some(path) => quote!(#path::loom::ops),
        None => quote!(::ristretto::loom::ops),
    };

    // handle struct generics
    let generics = &input.generics;
    let (impl_generics, ty_generics, _) = generics.split_for_impl();

    // prepare where clause
    let mut generics = generics.clone();
    let where_clause = generics.make_where_clause();
    where_clause.predicates.extend(user_bounds);

    quote! {
        impl #impl_generics #base_path::BlobOp for #name #ty_generics #where_clause {
            fn io(&self) -> Vec<#base_path::BlobIr> {
                vec![#(::core::clone::Clone::clone(&self.#io_fields)),*]
            }
        }
    }
}
