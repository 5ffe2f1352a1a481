//! Attention primitives shared by the text and vision towers.

use candle_core::{DType, Device, Result, Tensor};

/// Runs `f` on the CPU when the target is Metal, then moves the result over.
///
/// The Metal backend lacks a few index/arange kernels used for mask and
/// rotary table construction.
pub(crate) fn on_compute_device<F>(device: &Device, f: F) -> Result<Tensor>
where
    F: FnOnce(&Device) -> Result<Tensor>,
{
    if device.is_metal() {
        f(&Device::Cpu)?.to_device(device)
    } else {
        f(device)
    }
}

/// Scaled dot-product attention over `(batch, heads, seq, head_dim)` inputs.
///
/// Softmax runs in f32 regardless of the working dtype. With no explicit mask
/// and `is_causal`, a lower-triangular mask is applied; single-position
/// queries skip it since the whole prefix is attendable.
pub(crate) fn scaled_dot_product_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
    scale: f64,
    is_causal: bool,
) -> Result<Tensor> {
    let attn = (q.matmul(&k.transpose(2, 3)?)? * scale)?;
    let attn = match mask {
        Some(m) => attn.broadcast_add(m)?,
        None if is_causal && attn.dim(2)? > 1 => {
            let mask = create_causal_mask(attn.dim(2)?, attn.dim(3)?, attn.dtype(), q.device())?;
            attn.broadcast_add(&mask)?
        }
        None => attn,
    };
    let dtype = attn.dtype();
    let attn = candle_nn::ops::softmax_last_dim(&attn.to_dtype(DType::F32)?)?.to_dtype(dtype)?;
    attn.matmul(v)
}

/// Additive causal mask of shape `(1, 1, seq_len, kv_len)`.
///
/// Query row `i` may attend to key columns `<= i + (kv_len - seq_len)`, so a
/// suffix of queries masks correctly against a longer cached key sequence.
pub(crate) fn create_causal_mask(
    seq_len: usize,
    kv_len: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    on_compute_device(device, |compute| {
        let rows = Tensor::arange(0u32, seq_len as u32, compute)?.reshape((seq_len, 1))?;
        let cols = Tensor::arange(0u32, kv_len as u32, compute)?.reshape((1, kv_len))?;
        let offset = Tensor::new(kv_len.saturating_sub(seq_len) as u32, compute)?.reshape((1, 1))?;
        let allowed = cols
            .broadcast_le(&rows.broadcast_add(&offset)?)?
            .broadcast_as((seq_len, kv_len))?;

        let zeros = Tensor::zeros((seq_len, kv_len), dtype, compute)?;
        let neg_inf = Tensor::full(f32::NEG_INFINITY, (seq_len, kv_len), compute)?.to_dtype(dtype)?;
        allowed
            .where_cond(&zeros, &neg_inf)?
            .reshape((1, 1, seq_len, kv_len))
    })
}

/// Repeats key/value heads for grouped-query attention.
pub(crate) fn repeat_kv(x: &Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x.clone());
    }
    let (batch, num_kv_heads, seq_len, head_dim) = x.dims4()?;
    x.unsqueeze(2)?
        .expand((batch, num_kv_heads, n_rep, seq_len, head_dim))?
        .reshape((batch, num_kv_heads * n_rep, seq_len, head_dim))
}
