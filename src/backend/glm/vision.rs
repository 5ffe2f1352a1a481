//! Vision tower: patch embedding, windowed rotary positions, transformer
//! blocks and the spatial merger that hands embeddings to the decoder.

use super::attention::{on_compute_device, scaled_dot_product_attention};
use super::config::GlmVisionConfig;
use candle_core::{D, DType, Device, IndexOp, Result, Tensor};
use candle_nn::{
    Activation, Conv2d, Conv2dConfig, LayerNorm, LayerNormConfig, Linear, Module, RmsNorm,
    VarBuilder, layer_norm, linear_b, linear_no_bias, rms_norm,
};

/// The checkpoint stores a Conv3d; flattened patches make it a single matmul.
#[derive(Debug, Clone)]
struct PatchEmbed {
    weight: Tensor,
    bias: Tensor,
}

impl PatchEmbed {
    fn load(cfg: &GlmVisionConfig, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("patch_embed").pp("proj");
        let weight = vb.get(
            (
                cfg.hidden_size,
                cfg.in_channels,
                cfg.temporal_patch_size,
                cfg.patch_size,
                cfg.patch_size,
            ),
            "weight",
        )?;
        let bias = vb.get(cfg.hidden_size, "bias")?;
        let in_features =
            cfg.in_channels * cfg.temporal_patch_size * cfg.patch_size * cfg.patch_size;
        Ok(Self {
            weight: weight.reshape((cfg.hidden_size, in_features))?,
            bias,
        })
    }

    fn forward(&self, patches: &Tensor) -> Result<Tensor> {
        patches
            .matmul(&self.weight.transpose(0, 1)?)?
            .broadcast_add(&self.bias)
    }
}

#[derive(Debug, Clone)]
struct VisionRotaryEmbedding {
    inv_freq: Tensor,
}

impl VisionRotaryEmbedding {
    fn new(dim: usize, device: &Device, dtype: DType) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..dim)
            .step_by(2)
            .map(|i| 1f32 / 10000f32.powf(i as f32 / dim as f32))
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (dim / 2,), device)?.to_dtype(dtype)?;
        Ok(Self { inv_freq })
    }

    /// Frequency table `(seqlen, dim / 2)` for positions `0..seqlen`.
    fn forward(&self, seqlen: usize) -> Result<Tensor> {
        let half = self.inv_freq.dim(0)?;
        on_compute_device(self.inv_freq.device(), |compute| {
            let seq = Tensor::arange(0u32, seqlen as u32, compute)?
                .to_dtype(self.inv_freq.dtype())?
                .reshape((seqlen, 1))?;
            seq.matmul(&self.inv_freq.to_device(compute)?.reshape((1, half))?)
        })
    }
}

/// Half-split rotation: `[x1, x2]` becomes `[-x2, x1]`.
fn rotate_half_vision(x: &Tensor) -> Result<Tensor> {
    let half = x.dim(D::Minus1)? / 2;
    let x1 = x.narrow(D::Minus1, 0, half)?;
    let x2 = x.narrow(D::Minus1, half, half)?;
    Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)
}

fn apply_rotary_pos_emb_vision(
    q: &Tensor,
    k: &Tensor,
    cos: &Tensor,
    sin: &Tensor,
) -> Result<(Tensor, Tensor)> {
    let cos = cos.unsqueeze(D::Minus2)?;
    let sin = sin.unsqueeze(D::Minus2)?;
    let q_out = (q.broadcast_mul(&cos)? + rotate_half_vision(q)?.broadcast_mul(&sin)?)?;
    let k_out = (k.broadcast_mul(&cos)? + rotate_half_vision(k)?.broadcast_mul(&sin)?)?;
    Ok((q_out, k_out))
}

/// Patch positions `(seq, 2)` as (row, col), enumerated window by window so
/// they line up with the merge-block patch order.
fn block_order_index(h: usize, w: usize, merge: usize, device: &Device) -> Result<Tensor> {
    on_compute_device(device, |compute| {
        let rows = Tensor::arange(0u32, h as u32, compute)?
            .reshape((h, 1))?
            .broadcast_as((h, w))?;
        let cols = Tensor::arange(0u32, w as u32, compute)?
            .reshape((1, w))?
            .broadcast_as((h, w))?;
        let windowed = |grid: &Tensor| -> Result<Tensor> {
            grid.reshape((h / merge, merge, w / merge, merge))?
                .permute((0, 2, 1, 3))?
                .flatten(0, 3)
        };
        Tensor::stack(&[&windowed(&rows)?, &windowed(&cols)?], D::Minus1)
    })
}

#[derive(Debug, Clone)]
struct VisionAttention {
    qkv: Linear,
    proj: Linear,
    q_norm: RmsNorm,
    k_norm: RmsNorm,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl VisionAttention {
    fn load(cfg: &GlmVisionConfig, vb: VarBuilder) -> Result<Self> {
        let qkv = linear_b(
            cfg.hidden_size,
            cfg.hidden_size * 3,
            cfg.attention_bias,
            vb.pp("qkv"),
        )?;
        let proj = linear_b(
            cfg.hidden_size,
            cfg.hidden_size,
            cfg.attention_bias,
            vb.pp("proj"),
        )?;
        let head_dim = cfg.hidden_size / cfg.num_heads;
        let q_norm = rms_norm(head_dim, cfg.rms_norm_eps, vb.pp("q_norm"))?;
        let k_norm = rms_norm(head_dim, cfg.rms_norm_eps, vb.pp("k_norm"))?;
        Ok(Self {
            qkv,
            proj,
            q_norm,
            k_norm,
            num_heads: cfg.num_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    fn forward(&self, xs: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let seq_len = xs.dim(0)?;
        let qkv = self
            .qkv
            .forward(xs)?
            .reshape((seq_len, 3, self.num_heads, self.head_dim))?;
        let q = self.q_norm.forward(&qkv.i((.., 0, .., ..))?)?;
        let k = self.k_norm.forward(&qkv.i((.., 1, .., ..))?)?;
        let v = qkv.i((.., 2, .., ..))?;

        let (q, k) = apply_rotary_pos_emb_vision(&q, &k, cos, sin)?;
        let q = q.transpose(0, 1)?.contiguous()?.unsqueeze(0)?;
        let k = k.transpose(0, 1)?.contiguous()?.unsqueeze(0)?;
        let v = v.transpose(0, 1)?.contiguous()?.unsqueeze(0)?;

        let attn = scaled_dot_product_attention(&q, &k, &v, None, self.scale, false)?;
        let attn = attn
            .transpose(1, 2)?
            .reshape((seq_len, self.num_heads * self.head_dim))?;
        self.proj.forward(&attn)
    }
}

#[derive(Debug, Clone)]
struct VisionMlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
    act: Activation,
}

impl VisionMlp {
    fn load(cfg: &GlmVisionConfig, vb: VarBuilder) -> Result<Self> {
        let gate_proj = linear_b(cfg.hidden_size, cfg.intermediate_size, true, vb.pp("gate_proj"))?;
        let up_proj = linear_b(cfg.hidden_size, cfg.intermediate_size, true, vb.pp("up_proj"))?;
        let down_proj = linear_b(cfg.intermediate_size, cfg.hidden_size, true, vb.pp("down_proj"))?;
        Ok(Self {
            gate_proj,
            up_proj,
            down_proj,
            act: cfg.hidden_act,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let gate = self.gate_proj.forward(xs)?.apply(&self.act)?;
        let up = self.up_proj.forward(xs)?;
        self.down_proj.forward(&(gate * up)?)
    }
}

#[derive(Debug, Clone)]
struct VisionBlock {
    norm1: RmsNorm,
    norm2: RmsNorm,
    attn: VisionAttention,
    mlp: VisionMlp,
}

impl VisionBlock {
    fn load(cfg: &GlmVisionConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm1: rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("norm1"))?,
            norm2: rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("norm2"))?,
            attn: VisionAttention::load(cfg, vb.pp("attn"))?,
            mlp: VisionMlp::load(cfg, vb.pp("mlp"))?,
        })
    }

    fn forward(&self, xs: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let hidden = (xs + self.attn.forward(&self.norm1.forward(xs)?, cos, sin)?)?;
        &hidden + self.mlp.forward(&self.norm2.forward(&hidden)?)?
    }
}

/// Projects merged patches into the decoder's embedding space.
#[derive(Debug, Clone)]
struct PatchMerger {
    proj: Linear,
    post_projection_norm: LayerNorm,
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
    act: Activation,
}

impl PatchMerger {
    fn load(cfg: &GlmVisionConfig, vb: VarBuilder) -> Result<Self> {
        let proj = linear_no_bias(cfg.out_hidden_size, cfg.out_hidden_size, vb.pp("proj"))?;
        let ln_cfg = LayerNormConfig {
            eps: cfg.rms_norm_eps,
            remove_mean: true,
            affine: true,
        };
        let post_projection_norm =
            layer_norm(cfg.out_hidden_size, ln_cfg, vb.pp("post_projection_norm"))?;
        let context_dim = cfg.out_hidden_size * cfg.in_channels;
        let gate_proj = linear_no_bias(cfg.out_hidden_size, context_dim, vb.pp("gate_proj"))?;
        let up_proj = linear_no_bias(cfg.out_hidden_size, context_dim, vb.pp("up_proj"))?;
        let down_proj = linear_no_bias(context_dim, cfg.out_hidden_size, vb.pp("down_proj"))?;
        Ok(Self {
            proj,
            post_projection_norm,
            gate_proj,
            up_proj,
            down_proj,
            act: cfg.hidden_act,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let hidden = self.proj.forward(xs)?;
        let hidden = self.post_projection_norm.forward(&hidden)?.gelu()?;
        let gate = self.gate_proj.forward(&hidden)?.apply(&self.act)?;
        let up = self.up_proj.forward(&hidden)?;
        self.down_proj.forward(&(gate * up)?)
    }
}

#[derive(Debug, Clone)]
pub struct GlmVisionModel {
    cfg: GlmVisionConfig,
    patch_embed: PatchEmbed,
    rotary: VisionRotaryEmbedding,
    blocks: Vec<VisionBlock>,
    merger: PatchMerger,
    downsample: Conv2d,
    post_layernorm: RmsNorm,
}

impl GlmVisionModel {
    pub fn load(cfg: &GlmVisionConfig, vb: VarBuilder) -> Result<Self> {
        let patch_embed = PatchEmbed::load(cfg, vb.clone())?;
        let head_dim = cfg.hidden_size / cfg.num_heads;
        let rotary = VisionRotaryEmbedding::new(head_dim / 2, vb.device(), vb.dtype())?;

        let vb_blocks = vb.pp("blocks");
        let mut blocks = Vec::with_capacity(cfg.depth);
        for i in 0..cfg.depth {
            blocks.push(VisionBlock::load(cfg, vb_blocks.pp(i))?);
        }

        let merger = PatchMerger::load(cfg, vb.pp("merger"))?;
        let conv_cfg = Conv2dConfig {
            stride: cfg.spatial_merge_size,
            ..Conv2dConfig::default()
        };
        let downsample = candle_nn::conv2d(
            cfg.hidden_size,
            cfg.out_hidden_size,
            cfg.spatial_merge_size,
            conv_cfg,
            vb.pp("downsample"),
        )?;
        let post_layernorm = rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("post_layernorm"))?;

        Ok(Self {
            cfg: cfg.clone(),
            patch_embed,
            rotary,
            blocks,
            merger,
            downsample,
            post_layernorm,
        })
    }

    /// Rotary frequencies `(seq, head_dim / 2)` for every patch of the grid.
    fn rot_pos_emb(&self, grid_thw: (usize, usize, usize)) -> Result<Tensor> {
        let (_t, h, w) = grid_thw;
        let merge = self.cfg.spatial_merge_size;
        let pos_ids = block_order_index(h, w, merge, self.patch_embed.weight.device())?;

        let table = self.rotary.forward(h.max(w))?;
        table
            .index_select(&pos_ids.flatten(0, 1)?, 0)?
            .reshape((pos_ids.dim(0)?, 2, table.dim(1)?))?
            .flatten(1, 2)
    }

    /// Flattened patches to merged image embeddings `(tokens, out_hidden)`.
    pub fn forward(&self, pixel_values: &Tensor, grid_thw: (usize, usize, usize)) -> Result<Tensor> {
        let mut hidden = self.patch_embed.forward(pixel_values)?;

        let freqs = self.rot_pos_emb(grid_thw)?;
        let emb = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;
        let cos = emb.cos()?;
        let sin = emb.sin()?;

        for block in &self.blocks {
            hidden = block.forward(&hidden, &cos, &sin)?;
        }
        let hidden = self.post_layernorm.forward(&hidden)?;

        let merge = self.cfg.spatial_merge_size;
        let seq_len = hidden.dim(0)?;
        let hidden = hidden
            .reshape((seq_len / (merge * merge), merge, merge, self.cfg.hidden_size))?
            .permute((0, 3, 1, 2))?;
        let hidden = self.downsample.forward(&hidden)?;
        let hidden = hidden.reshape((hidden.dim(0)?, self.cfg.out_hidden_size))?;
        self.merger.forward(&hidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_cfg() -> GlmVisionConfig {
        GlmVisionConfig {
            hidden_size: 16,
            depth: 1,
            num_heads: 2,
            attention_bias: true,
            in_channels: 3,
            intermediate_size: 24,
            hidden_act: Activation::Silu,
            patch_size: 2,
            out_hidden_size: 12,
            rms_norm_eps: 1e-5,
            spatial_merge_size: 2,
            temporal_patch_size: 2,
        }
    }

    #[test]
    fn rotate_half_splits_at_the_midpoint() {
        let x = Tensor::from_vec(vec![1f32, 2.0, 3.0, 4.0], (1, 1, 4), &Device::Cpu).unwrap();
        let rotated = rotate_half_vision(&x).unwrap();
        assert_eq!(
            rotated.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![-3.0, -4.0, 1.0, 2.0]
        );
    }

    #[test]
    fn positions_enumerate_merge_windows_first() {
        let pos = block_order_index(4, 4, 2, &Device::Cpu).unwrap();
        let pos = pos.to_vec2::<u32>().unwrap();
        let rows: Vec<u32> = pos.iter().map(|p| p[0]).collect();
        let cols: Vec<u32> = pos.iter().map(|p| p[1]).collect();
        assert_eq!(rows, vec![0, 0, 1, 1, 0, 0, 1, 1, 2, 2, 3, 3, 2, 2, 3, 3]);
        assert_eq!(cols, vec![0, 1, 0, 1, 2, 3, 2, 3, 0, 1, 0, 1, 2, 3, 2, 3]);
    }

    #[test]
    fn zero_weight_tower_produces_merged_embeddings() {
        let cfg = tiny_cfg();
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let model = GlmVisionModel::load(&cfg, vb).unwrap();

        // Grid (1, 4, 4): 16 patches of dim 3 * 2 * 2 * 2.
        let pixel_values = Tensor::zeros((16, 24), DType::F32, &Device::Cpu).unwrap();
        let out = model.forward(&pixel_values, (1, 4, 4)).unwrap();
        assert_eq!(out.dims(), &[4, 12]);
    }
}
