//! Text decoder: grouped-query attention with multi-axis rotary embeddings
//! and a fused gate/up MLP.

use super::attention::{repeat_kv, scaled_dot_product_attention};
use super::config::GlmTextConfig;
use candle_core::{D, DType, Device, IndexOp, Result, Tensor, bail};
use candle_nn::kv_cache::KvCache;
use candle_nn::{
    Activation, Embedding, Linear, Module, RmsNorm, VarBuilder, embedding, linear_b,
    linear_no_bias, rms_norm,
};
use std::cell::RefCell;

/// Rotates adjacent pairs: `[x0, x1, x2, x3]` becomes `[-x1, x0, -x3, x2]`.
fn rotate_half_interleaved(x: &Tensor) -> Result<Tensor> {
    let (b, h, s, d) = x.dims4()?;
    if d % 2 != 0 {
        bail!("rotary dim must be even, got {d}");
    }
    let pairs = x.reshape((b, h, s, d / 2, 2))?;
    let even = pairs.i((.., .., .., .., 0))?;
    let odd = pairs.i((.., .., .., .., 1))?.neg()?;
    Tensor::stack(&[&odd, &even], D::Minus1)?.flatten_from(D::Minus2)
}

/// Spreads the first half over pairs: `[c0, c1, ..]` becomes `[c0, c0, c1, c1, ..]`.
fn duplicate_interleaved(x: &Tensor) -> Result<Tensor> {
    let (b, h, s, d) = x.dims4()?;
    let half = x.narrow(D::Minus1, 0, d / 2)?;
    Tensor::stack(&[&half, &half], D::Minus1)?.reshape((b, h, s, d))
}

/// Applies interleaved rotary embeddings to the first `rot_dim` features of
/// `q` and `k`; anything beyond passes through untouched.
fn apply_rotary_pos_emb(
    q: &Tensor,
    k: &Tensor,
    cos: &Tensor,
    sin: &Tensor,
) -> Result<(Tensor, Tensor)> {
    let cos = duplicate_interleaved(&cos.unsqueeze(1)?)?;
    let sin = duplicate_interleaved(&sin.unsqueeze(1)?)?;
    let rot_dim = cos.dim(D::Minus1)?;
    let head_dim = q.dim(D::Minus1)?;

    let q_rot = q.narrow(D::Minus1, 0, rot_dim)?;
    let k_rot = k.narrow(D::Minus1, 0, rot_dim)?;
    let mut q_out =
        (q_rot.broadcast_mul(&cos)? + rotate_half_interleaved(&q_rot)?.broadcast_mul(&sin)?)?;
    let mut k_out =
        (k_rot.broadcast_mul(&cos)? + rotate_half_interleaved(&k_rot)?.broadcast_mul(&sin)?)?;

    if rot_dim < head_dim {
        let q_pass = q.narrow(D::Minus1, rot_dim, head_dim - rot_dim)?;
        let k_pass = k.narrow(D::Minus1, rot_dim, head_dim - rot_dim)?;
        q_out = Tensor::cat(&[&q_out, &q_pass], D::Minus1)?;
        k_out = Tensor::cat(&[&k_out, &k_pass], D::Minus1)?;
    }
    Ok((q_out, k_out))
}

/// Collapses `(3, batch, seq, half)` frequencies to `(batch, seq, half)` by
/// taking each section from its position axis: temporal, height, width.
fn pick_mrope_sections(freqs: &Tensor, sections: &[usize]) -> Result<Tensor> {
    let (axes, _, _, _) = freqs.dims4()?;
    if axes != 3 {
        bail!("multi-axis frequencies need 3 leading axes, got {axes}");
    }
    let mut offset = 0;
    let mut parts = Vec::with_capacity(sections.len());
    for (i, &section) in sections.iter().enumerate() {
        let segment = freqs.narrow(D::Minus1, offset, section)?;
        parts.push(segment.i((i % 3, .., .., ..))?);
        offset += section;
    }
    let parts: Vec<&Tensor> = parts.iter().collect();
    Tensor::cat(&parts, D::Minus1)
}

#[derive(Debug, Clone)]
struct TextRotaryEmbedding {
    inv_freq: Tensor,
    mrope_section: Vec<usize>,
}

impl TextRotaryEmbedding {
    fn new(cfg: &GlmTextConfig, device: &Device) -> Result<Self> {
        let rope = &cfg.rope_parameters;
        if rope.rope_type != "default" {
            bail!("unsupported rope_type '{}'", rope.rope_type);
        }
        let head_dim = if cfg.head_dim > 0 {
            cfg.head_dim
        } else {
            cfg.hidden_size / cfg.num_attention_heads
        };
        let dim = (head_dim as f64 * rope.partial_rotary_factor).floor() as usize;
        if dim % 2 != 0 {
            bail!("rotary dim must be even, got {dim}");
        }
        let section_sum: usize = rope.mrope_section.iter().sum();
        if section_sum != dim / 2 {
            bail!("mrope_section sums to {section_sum}, expected {}", dim / 2);
        }

        let inv_freq: Vec<f32> = (0..dim)
            .step_by(2)
            .map(|i| (1.0 / rope.rope_theta.powf(i as f64 / dim as f64)) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (dim / 2,), device)?;
        Ok(Self {
            inv_freq,
            mrope_section: rope.mrope_section.clone(),
        })
    }

    /// Cos/sin tables of shape `(batch, seq, rot_dim)` for `(3, batch, seq)`
    /// position ids.
    fn forward(&self, dtype: DType, position_ids: &Tensor) -> Result<(Tensor, Tensor)> {
        let (axes, _, _) = position_ids.dims3()?;
        if axes != 3 {
            bail!("position_ids must be (3, batch, seq), got leading axis {axes}");
        }
        let half = self.inv_freq.dim(0)?;
        let inv = self.inv_freq.reshape((1, 1, 1, half))?;
        let freqs = position_ids
            .to_dtype(DType::F32)?
            .unsqueeze(3)?
            .broadcast_mul(&inv)?;
        let freqs = pick_mrope_sections(&freqs, &self.mrope_section)?;
        let emb = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;
        Ok((emb.cos()?.to_dtype(dtype)?, emb.sin()?.to_dtype(dtype)?))
    }
}

#[derive(Debug, Clone)]
struct TextMlp {
    gate_up_proj: Linear,
    down_proj: Linear,
    act: Activation,
}

impl TextMlp {
    fn load(cfg: &GlmTextConfig, vb: VarBuilder) -> Result<Self> {
        let gate_up_proj = linear_no_bias(
            cfg.hidden_size,
            cfg.intermediate_size * 2,
            vb.pp("gate_up_proj"),
        )?;
        let down_proj = linear_no_bias(cfg.intermediate_size, cfg.hidden_size, vb.pp("down_proj"))?;
        Ok(Self {
            gate_up_proj,
            down_proj,
            act: cfg.hidden_act,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let gate_up = self.gate_up_proj.forward(xs)?;
        let chunks = gate_up.chunk(2, D::Minus1)?;
        let [gate, up] = chunks.as_slice() else {
            bail!("gate_up_proj output did not split into two chunks");
        };
        self.down_proj.forward(&(up * gate.apply(&self.act)?)?)
    }
}

#[derive(Debug, Clone)]
struct TextAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    num_kv_groups: usize,
    head_dim: usize,
    scale: f64,
    kv_cache: RefCell<KvCache>,
}

impl TextAttention {
    fn load(cfg: &GlmTextConfig, vb: VarBuilder) -> Result<Self> {
        if cfg.num_attention_heads % cfg.num_key_value_heads != 0 {
            bail!(
                "num_attention_heads ({}) must be divisible by num_key_value_heads ({})",
                cfg.num_attention_heads,
                cfg.num_key_value_heads
            );
        }
        let q_proj = linear_b(
            cfg.hidden_size,
            cfg.num_attention_heads * cfg.head_dim,
            cfg.attention_bias,
            vb.pp("q_proj"),
        )?;
        let k_proj = linear_b(
            cfg.hidden_size,
            cfg.num_key_value_heads * cfg.head_dim,
            cfg.attention_bias,
            vb.pp("k_proj"),
        )?;
        let v_proj = linear_b(
            cfg.hidden_size,
            cfg.num_key_value_heads * cfg.head_dim,
            cfg.attention_bias,
            vb.pp("v_proj"),
        )?;
        let o_proj = linear_no_bias(
            cfg.num_attention_heads * cfg.head_dim,
            cfg.hidden_size,
            vb.pp("o_proj"),
        )?;

        let cache_cap = cfg.max_position_embeddings.min(16384);
        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads: cfg.num_attention_heads,
            num_kv_heads: cfg.num_key_value_heads,
            num_kv_groups: cfg.num_attention_heads / cfg.num_key_value_heads,
            head_dim: cfg.head_dim,
            scale: 1.0 / (cfg.head_dim as f64).sqrt(),
            kv_cache: RefCell::new(KvCache::new(2, cache_cap)),
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (b, seq_len, _) = xs.dims3()?;
        let q = self
            .q_proj
            .forward(xs)?
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .k_proj
            .forward(xs)?
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .v_proj
            .forward(xs)?
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let (q, k) = apply_rotary_pos_emb(&q, &k, cos, sin)?;
        // The cache appends along dim 2 and expects contiguous inputs.
        let (k, v) = self
            .kv_cache
            .borrow_mut()
            .append(&k.contiguous()?, &v.contiguous()?)?;
        let k = repeat_kv(&k, self.num_kv_groups)?;
        let v = repeat_kv(&v, self.num_kv_groups)?;

        let attn = scaled_dot_product_attention(&q, &k, &v, mask, self.scale, true)?;
        let attn = attn
            .transpose(1, 2)?
            .reshape((b, seq_len, self.num_heads * self.head_dim))?;
        self.o_proj.forward(&attn)
    }

    fn reset_cache(&self) {
        self.kv_cache.borrow_mut().reset();
    }
}

/// Decoder block with the sandwich norm layout: both the attention and MLP
/// branches are normalized before the residual add.
#[derive(Debug, Clone)]
struct TextDecoderLayer {
    self_attn: TextAttention,
    mlp: TextMlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
    post_self_attn_layernorm: RmsNorm,
    post_mlp_layernorm: RmsNorm,
}

impl TextDecoderLayer {
    fn load(cfg: &GlmTextConfig, vb: VarBuilder) -> Result<Self> {
        let self_attn = TextAttention::load(cfg, vb.pp("self_attn"))?;
        let mlp = TextMlp::load(cfg, vb.pp("mlp"))?;
        let input_layernorm =
            rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("input_layernorm"))?;
        let post_attention_layernorm = rms_norm(
            cfg.hidden_size,
            cfg.rms_norm_eps,
            vb.pp("post_attention_layernorm"),
        )?;
        let post_self_attn_layernorm = rms_norm(
            cfg.hidden_size,
            cfg.rms_norm_eps,
            vb.pp("post_self_attn_layernorm"),
        )?;
        let post_mlp_layernorm = rms_norm(
            cfg.hidden_size,
            cfg.rms_norm_eps,
            vb.pp("post_mlp_layernorm"),
        )?;
        Ok(Self {
            self_attn,
            mlp,
            input_layernorm,
            post_attention_layernorm,
            post_self_attn_layernorm,
            post_mlp_layernorm,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let hidden = self.input_layernorm.forward(xs)?;
        let hidden = self.self_attn.forward(&hidden, cos, sin, mask)?;
        let hidden = self.post_self_attn_layernorm.forward(&hidden)?;
        let hidden = (xs + hidden)?;

        let out = self.post_attention_layernorm.forward(&hidden)?;
        let out = self.mlp.forward(&out)?;
        let out = self.post_mlp_layernorm.forward(&out)?;
        hidden + out
    }
}

#[derive(Debug, Clone)]
pub struct GlmTextModel {
    embed_tokens: Embedding,
    layers: Vec<TextDecoderLayer>,
    norm: RmsNorm,
    rotary: TextRotaryEmbedding,
}

impl GlmTextModel {
    pub fn load(cfg: &GlmTextConfig, vb: VarBuilder) -> Result<Self> {
        let embed_tokens = embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("embed_tokens"))?;
        let rotary = TextRotaryEmbedding::new(cfg, vb.device())?;
        let vb_layers = vb.pp("layers");
        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        for idx in 0..cfg.num_hidden_layers {
            layers.push(TextDecoderLayer::load(cfg, vb_layers.pp(idx))?);
        }
        let norm = rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("norm"))?;
        Ok(Self {
            embed_tokens,
            layers,
            norm,
            rotary,
        })
    }

    pub fn embed(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.embed_tokens.forward(input_ids)
    }

    /// The embedding matrix, for a tied output head.
    pub fn token_embedding_weight(&self) -> Tensor {
        self.embed_tokens.embeddings().clone()
    }

    pub fn forward(
        &self,
        inputs_embeds: &Tensor,
        position_ids: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (cos, sin) = self.rotary.forward(inputs_embeds.dtype(), position_ids)?;
        let mut hidden = inputs_embeds.clone();
        for layer in &self.layers {
            hidden = layer.forward(&hidden, &cos, &sin, mask)?;
        }
        self.norm.forward(&hidden)
    }

    /// Drops all cached key/value entries so a new sequence can start.
    pub fn reset_cache(&self) {
        for layer in &self.layers {
            layer.self_attn.reset_cache();
        }
    }
}
