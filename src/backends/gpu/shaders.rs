//! WGSL compute shaders for the embedding kernels
//!
//! Bindings shared by the lookup kernels:
//!
//! | Binding | Buffer          | Access                      |
//! |---------|-----------------|-----------------------------|
//! | 0       | weights         | read (forward), read_write  |
//! | 1       | table_offsets   | read                        |
//! | 2       | indices         | read (read_write: refresh)  |
//! | 3       | offsets         | read                        |
//! | 4       | output / grad   | read_write / read           |
//! | 5       | fault           | atomic `[flag, max index]`  |
//! | 6       | params          | uniform                     |
//! | 7       | optimizer state | read_write (Adagrad)        |
//!
//! One workgroup of 64 threads handles `block_size` consecutive bags; threads
//! stride over the embedding dimension. The `_shmem` entry points stage the
//! resolved rows of each bag in workgroup memory before touching weights.
//! Summation order over a bag is the same in every entry point.

/// Threads per workgroup, matches `WORKGROUP_SIZE` below
pub const WORKGROUP_SIZE: u32 = 64;

const PARAMS: &str = r#"
struct Params {
    num_bags: u32,
    num_tables: u32,
    num_embeddings: u32,
    embedding_dim: u32,
    block_size: u32,
    seed: u32,
    num_indices: u32,
    _pad0: u32,
    learning_rate: f32,
    eps: f32,
    _pad1: f32,
    _pad2: f32,
}

@group(0) @binding(6) var<uniform> params: Params;

const WORKGROUP_SIZE: u32 = 64u;
"#;

const LOOKUP: &str = r#"
@group(0) @binding(1) var<storage, read> table_offsets: array<u32>;
@group(0) @binding(2) var<storage, read> indices: array<u32>;
@group(0) @binding(3) var<storage, read> offsets: array<u32>;
@group(0) @binding(5) var<storage, read_write> fault: array<atomic<u32>, 2>;

const STAGE: u32 = 256u;
const INVALID_ROW: u32 = 0xffffffffu;

var<workgroup> bag_start: u32;
var<workgroup> bag_end: u32;
var<workgroup> staged_rows: array<u32, 256>;

fn block_id(wid: vec3<u32>, nwg: vec3<u32>) -> u32 {
    return wid.y * nwg.x + wid.x;
}

// Weight row of indices[j] in `bag`; records a fault for out-of-range indices
fn lookup_row(bag: u32, j: u32) -> u32 {
    let idx = indices[j];
    if (idx >= params.num_embeddings) {
        atomicStore(&fault[0], 1u);
        atomicMax(&fault[1], idx);
        return INVALID_ROW;
    }
    return table_offsets[bag % params.num_tables] + idx;
}

// [start, end) of `bag`, uniform across the workgroup
fn load_bag(bag: u32, lid: u32) -> vec2<u32> {
    if (lid == 0u) {
        bag_start = offsets[bag];
        bag_end = offsets[bag + 1u];
    }
    let start = workgroupUniformLoad(&bag_start);
    let end = workgroupUniformLoad(&bag_end);
    return vec2<u32>(start, end);
}

// Resolve rows [c, c + n) of `bag` into staged_rows
fn stage_rows(bag: u32, c: u32, n: u32, lid: u32) {
    for (var i = lid; i < n; i = i + WORKGROUP_SIZE) {
        staged_rows[i] = lookup_row(bag, c + i);
    }
    workgroupBarrier();
}
"#;

const FORWARD: &str = r#"
@group(0) @binding(0) var<storage, read> weights: array<f32>;
@group(0) @binding(4) var<storage, read_write> output: array<f32>;

@compute @workgroup_size(64)
fn forward(
    @builtin(workgroup_id) wid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
    @builtin(local_invocation_index) lid: u32,
) {
    let dim = params.embedding_dim;
    let first = block_id(wid, nwg) * params.block_size;
    for (var k = 0u; k < params.block_size; k = k + 1u) {
        let bag = first + k;
        if (bag >= params.num_bags) {
            break;
        }
        let span = load_bag(bag, lid);
        for (var d = lid; d < dim; d = d + WORKGROUP_SIZE) {
            var acc = 0.0;
            for (var j = span.x; j < span.y; j = j + 1u) {
                let row = lookup_row(bag, j);
                if (row != INVALID_ROW) {
                    acc = acc + weights[row * dim + d];
                }
            }
            output[bag * dim + d] = acc;
        }
        workgroupBarrier();
    }
}

@compute @workgroup_size(64)
fn forward_shmem(
    @builtin(workgroup_id) wid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
    @builtin(local_invocation_index) lid: u32,
) {
    let dim = params.embedding_dim;
    let first = block_id(wid, nwg) * params.block_size;
    for (var k = 0u; k < params.block_size; k = k + 1u) {
        let bag = first + k;
        if (bag >= params.num_bags) {
            break;
        }
        let span = load_bag(bag, lid);
        for (var c = span.x; c < span.y; c = c + STAGE) {
            let n = min(STAGE, span.y - c);
            stage_rows(bag, c, n, lid);
            for (var d = lid; d < dim; d = d + WORKGROUP_SIZE) {
                var acc = select(output[bag * dim + d], 0.0, c == span.x);
                for (var i = 0u; i < n; i = i + 1u) {
                    let row = staged_rows[i];
                    if (row != INVALID_ROW) {
                        acc = acc + weights[row * dim + d];
                    }
                }
                output[bag * dim + d] = acc;
            }
            workgroupBarrier();
        }
    }
}
"#;

const SGD: &str = r#"
@group(0) @binding(0) var<storage, read_write> weights: array<f32>;
@group(0) @binding(4) var<storage, read> grad: array<f32>;

fn sgd_row(row: u32, bag: u32, lid: u32) {
    let dim = params.embedding_dim;
    if (row == INVALID_ROW) {
        return;
    }
    for (var d = lid; d < dim; d = d + WORKGROUP_SIZE) {
        let w = row * dim + d;
        weights[w] = weights[w] - params.learning_rate * grad[bag * dim + d];
    }
}

@compute @workgroup_size(64)
fn sgd(
    @builtin(workgroup_id) wid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
    @builtin(local_invocation_index) lid: u32,
) {
    let first = block_id(wid, nwg) * params.block_size;
    for (var k = 0u; k < params.block_size; k = k + 1u) {
        let bag = first + k;
        if (bag >= params.num_bags) {
            break;
        }
        let span = load_bag(bag, lid);
        for (var j = span.x; j < span.y; j = j + 1u) {
            sgd_row(lookup_row(bag, j), bag, lid);
        }
        workgroupBarrier();
    }
}

@compute @workgroup_size(64)
fn sgd_shmem(
    @builtin(workgroup_id) wid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
    @builtin(local_invocation_index) lid: u32,
) {
    let first = block_id(wid, nwg) * params.block_size;
    for (var k = 0u; k < params.block_size; k = k + 1u) {
        let bag = first + k;
        if (bag >= params.num_bags) {
            break;
        }
        let span = load_bag(bag, lid);
        for (var c = span.x; c < span.y; c = c + STAGE) {
            let n = min(STAGE, span.y - c);
            stage_rows(bag, c, n, lid);
            for (var i = 0u; i < n; i = i + 1u) {
                sgd_row(staged_rows[i], bag, lid);
            }
            workgroupBarrier();
        }
    }
}
"#;

const ADAGRAD: &str = r#"
@group(0) @binding(0) var<storage, read_write> weights: array<f32>;
@group(0) @binding(4) var<storage, read> grad: array<f32>;
@group(0) @binding(7) var<storage, read_write> state: array<f32>;

var<workgroup> partial: array<f32, 64>;
var<workgroup> mean_sq: f32;
var<workgroup> multiplier: f32;

@compute @workgroup_size(64)
fn adagrad(
    @builtin(workgroup_id) wid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
    @builtin(local_invocation_index) lid: u32,
) {
    let dim = params.embedding_dim;
    let first = block_id(wid, nwg) * params.block_size;
    for (var k = 0u; k < params.block_size; k = k + 1u) {
        let bag = first + k;
        if (bag >= params.num_bags) {
            break;
        }
        let span = load_bag(bag, lid);

        var sq = 0.0;
        for (var d = lid; d < dim; d = d + WORKGROUP_SIZE) {
            let g = grad[bag * dim + d];
            sq = sq + g * g;
        }
        partial[lid] = sq;
        workgroupBarrier();
        if (lid == 0u) {
            var total = 0.0;
            for (var i = 0u; i < WORKGROUP_SIZE; i = i + 1u) {
                total = total + partial[i];
            }
            mean_sq = total / f32(dim);
        }
        workgroupBarrier();

        for (var j = span.x; j < span.y; j = j + 1u) {
            let row = lookup_row(bag, j);
            if (lid == 0u && row != INVALID_ROW) {
                let s = state[row] + mean_sq;
                state[row] = s;
                multiplier = params.learning_rate / (sqrt(s) + params.eps);
            }
            workgroupBarrier();
            if (row != INVALID_ROW) {
                let m = multiplier;
                for (var d = lid; d < dim; d = d + WORKGROUP_SIZE) {
                    let w = row * dim + d;
                    weights[w] = weights[w] - m * grad[bag * dim + d];
                }
            }
            workgroupBarrier();
        }
    }
}
"#;

const REFRESH: &str = r#"
@group(0) @binding(2) var<storage, read_write> indices: array<u32>;

fn hash(x: u32) -> u32 {
    var h = x;
    h = h ^ (h >> 16u);
    h = h * 0x7feb352du;
    h = h ^ (h >> 15u);
    h = h * 0x846ca68bu;
    h = h ^ (h >> 16u);
    return h;
}

@compute @workgroup_size(64)
fn refresh(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let i = gid.y * nwg.x * WORKGROUP_SIZE + gid.x;
    if (i >= params.num_indices) {
        return;
    }
    indices[i] = hash(i ^ hash(params.seed)) % (params.num_embeddings - 1u);
}
"#;

/// Forward kernels: entry points `forward`, `forward_shmem`
pub fn forward_source() -> String {
    [PARAMS, LOOKUP, FORWARD].concat()
}

/// SGD kernels: entry points `sgd`, `sgd_shmem`
pub fn sgd_source() -> String {
    [PARAMS, LOOKUP, SGD].concat()
}

/// Approximate row-wise Adagrad kernel: entry point `adagrad`
pub fn adagrad_source() -> String {
    [PARAMS, LOOKUP, ADAGRAD].concat()
}

/// Index refresh kernel: entry point `refresh`
pub fn refresh_source() -> String {
    [PARAMS, REFRESH].concat()
}
