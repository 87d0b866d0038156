//! WGSL sources of the built-in kernels.
//!
//! Every kernel binds its parameters as a uniform at binding 0 and its blobs at bindings 1.. in
//! the order of the op's fields. Workgroups hold 64 invocations; large launches spill into the `y`
//! dimension of the grid, so the flat index is `id.x + id.y * groups.x * 64`.

use crate::loom::device::gpu::Shader;

pub const NEURON_FORWARD: Shader = Shader {
    name: "neuron_forward",
    source: r#"
struct Params {
    len: u32,
    kind: u32,
    param: f32,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read_write> output: array<f32>;

fn activate(x: f32) -> f32 {
    switch params.kind {
        case 1u: { return max(x, params.param); }
        case 2u: { return select(0.01 * x, x, x > 0.0); }
        case 3u: { return select(exp(params.param) + (x - params.param), exp(x), x < params.param); }
        case 4u: { return select(1e-3, 1e-3 + x, x >= 0.0); }
        case 5u: { return 1.0 / (1.0 + exp(-x)); }
        case 6u: { return 1e-4 + 1.0 / (1.0 + exp(-x)); }
        case 7u: { return tanh(x); }
        case 8u: { return exp(x); }
        default: { return x; }
    }
}

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>, @builtin(num_workgroups) groups: vec3<u32>) {
    let index = id.x + id.y * groups.x * 64u;
    if index >= params.len {
        return;
    }
    output[index] = activate(output[index]);
}
"#,
};

pub const NEURON_BACKWARD: Shader = Shader {
    name: "neuron_backward",
    source: r#"
struct Params {
    len: u32,
    kind: u32,
    param: f32,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> output: array<f32>;
@group(0) @binding(2) var<storage, read_write> gradient: array<f32>;

fn factor(y: f32) -> f32 {
    switch params.kind {
        case 1u: { return select(0.0, 1.0, y > params.param); }
        case 2u: { return select(0.01, 1.0, y > 0.0); }
        case 3u: { return select(1.0, exp(y), y < params.param); }
        case 4u: { return select(0.0, 1.0, y < 0.0); }
        case 5u, 6u: { return y * (1.0 - y); }
        case 7u: { return 1.0 - y * y; }
        case 8u: { return y; }
        default: { return 1.0; }
    }
}

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>, @builtin(num_workgroups) groups: vec3<u32>) {
    let index = id.x + id.y * groups.x * 64u;
    if index >= params.len {
        return;
    }
    gradient[index] = gradient[index] * factor(output[index]);
}
"#,
};

pub const GAUSSIAN_RECON_LOSS: Shader = Shader {
    name: "gaussian_recon_loss",
    source: r#"
struct Params {
    len: u32,
}

const HALF_LOG_2PI: f32 = 0.9189385332046727;

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> mu: array<f32>;
@group(0) @binding(2) var<storage, read> sigma: array<f32>;
@group(0) @binding(3) var<storage, read> x: array<f32>;
@group(0) @binding(4) var<storage, read_write> terms: array<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>, @builtin(num_workgroups) groups: vec3<u32>) {
    let index = id.x + id.y * groups.x * 64u;
    if index >= params.len {
        return;
    }
    let s = sigma[index];
    let d = x[index] - mu[index];
    terms[index] = log(s) + HALF_LOG_2PI + d * d / (2.0 * s * s);
}
"#,
};

pub const GAUSSIAN_RECON_GRAD: Shader = Shader {
    name: "gaussian_recon_grad",
    source: r#"
struct Params {
    len: u32,
    scale: f32,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> mu: array<f32>;
@group(0) @binding(2) var<storage, read> sigma: array<f32>;
@group(0) @binding(3) var<storage, read> x: array<f32>;
@group(0) @binding(4) var<storage, read_write> mu_diff: array<f32>;
@group(0) @binding(5) var<storage, read_write> sigma_diff: array<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>, @builtin(num_workgroups) groups: vec3<u32>) {
    let index = id.x + id.y * groups.x * 64u;
    if index >= params.len {
        return;
    }
    let s = sigma[index];
    let d = x[index] - mu[index];
    mu_diff[index] = -params.scale * d / (s * s);
    sigma_diff[index] = params.scale * (1.0 / s - d * d / (s * s * s));
}
"#,
};

pub const ENCODER_LOSS: Shader = Shader {
    name: "encoder_loss",
    source: r#"
struct Params {
    len: u32,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> mu: array<f32>;
@group(0) @binding(2) var<storage, read> sigma: array<f32>;
@group(0) @binding(3) var<storage, read_write> terms: array<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>, @builtin(num_workgroups) groups: vec3<u32>) {
    let index = id.x + id.y * groups.x * 64u;
    if index >= params.len {
        return;
    }
    let m = mu[index];
    let s = sigma[index];
    terms[index] = -(1.0 + 2.0 * log(s) - m * m - s * s);
}
"#,
};

pub const ENCODER_GRAD: Shader = Shader {
    name: "encoder_grad",
    source: r#"
struct Params {
    len: u32,
    scale: f32,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> mu: array<f32>;
@group(0) @binding(2) var<storage, read> sigma: array<f32>;
@group(0) @binding(3) var<storage, read_write> mu_diff: array<f32>;
@group(0) @binding(4) var<storage, read_write> sigma_diff: array<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>, @builtin(num_workgroups) groups: vec3<u32>) {
    let index = id.x + id.y * groups.x * 64u;
    if index >= params.len {
        return;
    }
    let s = sigma[index];
    mu_diff[index] = params.scale * 2.0 * mu[index];
    sigma_diff[index] = params.scale * (2.0 * s - 2.0 / s);
}
"#,
};

pub const GEMM: Shader = Shader {
    name: "gemm",
    source: r#"
struct Params {
    len: u32,
    m: u32,
    n: u32,
    k: u32,
    trans_a: u32,
    trans_b: u32,
    alpha: f32,
    beta: f32,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> a: array<f32>;
@group(0) @binding(2) var<storage, read> b: array<f32>;
@group(0) @binding(3) var<storage, read_write> c: array<f32>;

fn index_a(i: u32, p: u32) -> u32 {
    return select(i + p * params.m, p + i * params.k, params.trans_a != 0u);
}

fn index_b(p: u32, j: u32) -> u32 {
    return select(p + j * params.k, j + p * params.n, params.trans_b != 0u);
}

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>, @builtin(num_workgroups) groups: vec3<u32>) {
    let index = id.x + id.y * groups.x * 64u;
    if index >= params.len {
        return;
    }
    let i = index % params.m;
    let j = index / params.m;

    var sum = 0.0;
    for (var p = 0u; p < params.k; p++) {
        sum += a[index_a(i, p)] * b[index_b(p, j)];
    }
    if params.beta == 0.0 {
        c[index] = params.alpha * sum;
    } else {
        c[index] = params.alpha * sum + params.beta * c[index];
    }
}
"#,
};

pub const AXPY: Shader = Shader {
    name: "axpy",
    source: r#"
struct Params {
    len: u32,
    alpha: f32,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> x: array<f32>;
@group(0) @binding(2) var<storage, read_write> y: array<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>, @builtin(num_workgroups) groups: vec3<u32>) {
    let index = id.x + id.y * groups.x * 64u;
    if index >= params.len {
        return;
    }
    y[index] = y[index] + params.alpha * x[index];
}
"#,
};

pub const ELEMENT_WISE: Shader = Shader {
    name: "element_wise",
    source: r#"
struct Params {
    len: u32,
    functor: u32,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> a: array<f32>;
@group(0) @binding(2) var<storage, read> b: array<f32>;
@group(0) @binding(3) var<storage, read_write> output: array<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>, @builtin(num_workgroups) groups: vec3<u32>) {
    let index = id.x + id.y * groups.x * 64u;
    if index >= params.len {
        return;
    }
    let x = a[index];
    let y = b[index];
    switch params.functor {
        case 1u: { output[index] = x - y; }
        case 2u: { output[index] = x * y; }
        case 3u: { output[index] = x / y; }
        default: { output[index] = x + y; }
    }
}
"#,
};

pub const ELEMENT_WISE_GRAD: Shader = Shader {
    name: "element_wise_grad",
    source: r#"
struct Params {
    len: u32,
    functor: u32,
    operand: u32,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> a: array<f32>;
@group(0) @binding(2) var<storage, read> b: array<f32>;
@group(0) @binding(3) var<storage, read> top_diff: array<f32>;
@group(0) @binding(4) var<storage, read_write> diff: array<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>, @builtin(num_workgroups) groups: vec3<u32>) {
    let index = id.x + id.y * groups.x * 64u;
    if index >= params.len {
        return;
    }
    let x = a[index];
    let y = b[index];
    let d = top_diff[index];
    let lhs = params.operand == 0u;
    switch params.functor {
        case 1u: { diff[index] = select(-d, d, lhs); }
        case 2u: { diff[index] = select(d * x, d * y, lhs); }
        case 3u: { diff[index] = select(-d * x / (y * y), d / y, lhs); }
        default: { diff[index] = d; }
    }
}
"#,
};
