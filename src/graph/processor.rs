//! Spatio-temporal graph reasoning engine.
//!
//! Treats the L per-frame feature maps of a sequence as nodes of a temporal
//! chain graph and refines them jointly over a fixed number of rounds:
//!
//! 1. intra-frame self-attention over spatial positions;
//! 2. inter-frame gated message passing between nodes within a bounded
//!    index radius, optionally edge-conditioned and direction-aware;
//! 3. recurrent fusion through a [`ConvGru`], residual add, layer norm.
//!
//! Updates are synchronous (Jacobi): every node's round-k state is computed
//! from the frozen round-(k−1) snapshot, never from a round-k value of
//! another node. That is what permits the intra-round node parallelism.

use ndarray::{s, Array1, Array2, Array3, Array5};
use rand::rngs::StdRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SalError};
use crate::graph::conv_gru::ConvGru;
use crate::kernels::activation::{sigmoid, softmax_rows};
use crate::kernels::conv::{Conv2d, Linear};
use crate::kernels::norm::LayerNorm;
use crate::kernels::resize::global_avg_pool;

const GRU_KERNEL: usize = 3;
const GRU_PADDING: usize = 1;

/// Static shape and topology parameters of the engine.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Feature channels C of every node.
    pub hidden_channels: usize,

    /// Expected node count L; cross-checked against the input tensor.
    pub sequence_length: usize,

    /// Spatial size of every node's feature map.
    pub height: usize,
    pub width: usize,

    /// Neighbourhood radius R: `|i − j| <= R`, `i != j`.
    pub neighbor_radius: usize,

    /// Refinement rounds; 0 is the identity.
    pub n_iterations: usize,

    /// Concatenate the signed offset `i − j` as an extra message channel.
    pub with_edge_features: bool,

    /// Separate message kernels for past and future neighbours.
    pub with_directional_kernels: bool,
}

/// Message-convolution kernels: one shared, or a past/future pair.
#[derive(Clone, Serialize, Deserialize)]
enum MessageKernels {
    Shared(Conv2d),
    Directional { past: Conv2d, future: Conv2d },
}

impl MessageKernels {
    /// Kernel for a message flowing from node `j` into node `i`.
    fn select(&self, i: usize, j: usize) -> &Conv2d {
        match self {
            MessageKernels::Shared(conv) => conv,
            MessageKernels::Directional { past, future } => {
                if j < i {
                    past
                } else {
                    future
                }
            }
        }
    }
}

/// The graph reasoning engine. Holds only read-only learned parameters;
/// node states are ephemeral per forward call.
#[derive(Clone, Serialize, Deserialize)]
pub struct GraphProcessor {
    config: GraphConfig,

    /// Attention score scale, `C^{-1/2}`.
    scale: f32,

    intra_query: Conv2d,
    intra_key: Conv2d,
    intra_value: Conv2d,

    /// Learned mix of attention output and identity, initialised to 1.
    pub intra_alpha: f32,

    message: MessageKernels,
    inter_weight: Linear,
    inter_gate: Conv2d,

    /// Learned intra/inter fusion scalar, clamped to [0, 1] at use.
    pub fusion_weight: f32,

    gru: ConvGru,
    norm: LayerNorm,
}

impl GraphProcessor {
    pub fn zeros(config: GraphConfig) -> Self {
        let c = config.hidden_channels;
        let message_in = c + usize::from(config.with_edge_features);
        let message = if config.with_directional_kernels {
            MessageKernels::Directional {
                past: Conv2d::zeros(c, message_in, 1, 0),
                future: Conv2d::zeros(c, message_in, 1, 0),
            }
        } else {
            MessageKernels::Shared(Conv2d::zeros(c, message_in, 1, 0))
        };
        Self {
            config,
            scale: (c as f32).powf(-0.5),
            intra_query: Conv2d::zeros(c, c, 1, 0),
            intra_key: Conv2d::zeros(c, c, 1, 0),
            intra_value: Conv2d::zeros(c, c, 1, 0),
            intra_alpha: 1.0,
            message,
            inter_weight: Linear::zeros(c, c, false),
            inter_gate: Conv2d::zeros(c, c, 1, 0),
            fusion_weight: 0.5,
            gru: ConvGru::zeros(c, GRU_KERNEL, GRU_PADDING),
            norm: LayerNorm::new(c, config.height, config.width),
        }
    }

    pub fn init(rng: &mut StdRng, config: GraphConfig) -> Self {
        let c = config.hidden_channels;
        let message_in = c + usize::from(config.with_edge_features);
        let message = if config.with_directional_kernels {
            MessageKernels::Directional {
                past: Conv2d::init(rng, c, message_in, 1, 0, 1, true),
                future: Conv2d::init(rng, c, message_in, 1, 0, 1, true),
            }
        } else {
            MessageKernels::Shared(Conv2d::init(rng, c, message_in, 1, 0, 1, true))
        };
        Self {
            config,
            scale: (c as f32).powf(-0.5),
            intra_query: Conv2d::init(rng, c, c, 1, 0, 1, true),
            intra_key: Conv2d::init(rng, c, c, 1, 0, 1, true),
            intra_value: Conv2d::init(rng, c, c, 1, 0, 1, true),
            intra_alpha: 1.0,
            message,
            inter_weight: Linear::init(rng, c, c, false),
            inter_gate: Conv2d::init(rng, c, c, 1, 0, 1, true),
            fusion_weight: 0.5,
            gru: ConvGru::init(rng, c, GRU_KERNEL, GRU_PADDING),
            norm: LayerNorm::new(c, config.height, config.width),
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Zero every learned bias, leaving weights intact. Preserves the zero
    /// fixed point of the refinement (see the all-zero scenario test).
    pub fn zero_biases(&mut self) {
        let convs: Vec<&mut Conv2d> = match &mut self.message {
            MessageKernels::Shared(conv) => vec![conv],
            MessageKernels::Directional { past, future } => vec![past, future],
        };
        for conv in convs
            .into_iter()
            .chain([&mut self.intra_query, &mut self.intra_key, &mut self.intra_value])
            .chain([&mut self.inter_gate, &mut self.gru.conv_zr, &mut self.gru.conv_h])
        {
            if let Some(bias) = conv.bias.as_mut() {
                bias.fill(0.0);
            }
        }
    }

    /// Broadcast edge feature for the edge j → i: a constant (1, H, W) map
    /// holding the signed index offset `i − j`.
    pub fn edge_feature(i: usize, j: usize, height: usize, width: usize) -> Array3<f32> {
        Array3::from_elem((1, height, width), i as f32 - j as f32)
    }

    /// Refine (L, batch, C, H, W) node features over `n_iterations` rounds.
    pub fn forward(&self, x: &Array5<f32>) -> Result<Array5<f32>> {
        let (l, batch, c, h, w) = x.dim();
        if l != self.config.sequence_length {
            return Err(SalError::shape(
                format!("sequence length {}", self.config.sequence_length),
                format!("sequence length {}", l),
            ));
        }
        let expected = self.norm.shape();
        if (c, h, w) != expected {
            return Err(SalError::shape(
                format!("node shape {:?}", expected),
                format!("node shape {:?}", (c, h, w)),
            ));
        }
        if self.config.n_iterations == 0 {
            return Ok(x.clone());
        }

        let mut state = x.clone();
        for round in 0..self.config.n_iterations {
            // Jacobi update: all reads target the frozen `state` snapshot.
            let updates: Vec<Array3<f32>> = (0..l * batch)
                .into_par_iter()
                .map(|idx| self.update_node(&state, idx / batch, idx % batch))
                .collect();

            let mut next = Array5::zeros((l, batch, c, h, w));
            for (idx, update) in updates.into_iter().enumerate() {
                next.slice_mut(s![idx / batch, idx % batch, .., .., ..])
                    .assign(&update);
            }
            state = next;
            tracing::debug!(round, "graph refinement round complete");
        }
        Ok(state)
    }

    /// One node's round update, reading only the given snapshot.
    pub(crate) fn update_node(&self, snapshot: &Array5<f32>, i: usize, b: usize) -> Array3<f32> {
        let l = snapshot.dim().0;
        let h_i = snapshot.slice(s![i, b, .., .., ..]).to_owned();

        let intra = self.intra_attention(&h_i);

        let radius = self.config.neighbor_radius;
        let lo = i.saturating_sub(radius);
        let hi = (i + radius).min(l - 1);
        let neighbors: Vec<(usize, Array3<f32>)> = (lo..=hi)
            .filter(|&j| j != i)
            .map(|j| (j, snapshot.slice(s![j, b, .., .., ..]).to_owned()))
            .collect();
        let inter = self.inter_messages(i, &h_i, &neighbors);

        let combined = self.fuse(&intra, &inter);
        let next = self.gru.forward(&combined, &h_i) + &h_i;
        self.norm.forward(&next)
    }

    /// `w·intra + (1 − w)·inter` with `w` clamped to [0, 1].
    pub(crate) fn fuse(&self, intra: &Array3<f32>, inter: &Array3<f32>) -> Array3<f32> {
        let w = self.fusion_weight.clamp(0.0, 1.0);
        intra * w + inter * (1.0 - w)
    }

    /// Intra-frame spatial self-attention: `alpha·attn(x) + x`.
    pub(crate) fn intra_attention(&self, x: &Array3<f32>) -> Array3<f32> {
        self.intra_attention_with_weights(x).0
    }

    fn intra_attention_with_weights(&self, x: &Array3<f32>) -> (Array3<f32>, Array2<f32>) {
        let (c, h, w) = x.dim();
        let hw = h * w;

        let query = flatten_spatial(&self.intra_query.forward(x));
        let key = flatten_spatial(&self.intra_key.forward(x));
        let value = flatten_spatial(&self.intra_value.forward(x));

        // [hw, hw]: rows are query positions, columns are key positions.
        let scores = query.t().dot(&key) * self.scale;
        let attention = softmax_rows(&scores);

        // [hw, c] weighted value sum, folded back to (C, H, W).
        let context = attention.dot(&value.t());
        let mut out = Array3::zeros((c, h, w));
        for pos in 0..hw {
            for ch in 0..c {
                out[[ch, pos / w, pos % w]] = context[[pos, ch]];
            }
        }

        (out * self.intra_alpha + x, attention)
    }

    /// Gated sum of messages from all qualifying neighbours; zero when the
    /// neighbour set is empty (isolated node or R = 0).
    pub(crate) fn inter_messages(
        &self,
        i: usize,
        x: &Array3<f32>,
        neighbors: &[(usize, Array3<f32>)],
    ) -> Array3<f32> {
        let mut sum = Array3::zeros(x.dim());
        let x_flat = flatten_spatial(x);
        for (j, y) in neighbors {
            let (message, gate) = self.neighbor_message(i, &x_flat, *j, y);
            for (c, plane) in message.outer_iter().enumerate() {
                let mut target = sum.slice_mut(s![c, .., ..]);
                target += &(&plane * gate[c]);
            }
        }
        sum
    }

    /// A single neighbour's attended message and its per-channel gate.
    fn neighbor_message(
        &self,
        i: usize,
        x_flat: &Array2<f32>,
        j: usize,
        y: &Array3<f32>,
    ) -> (Array3<f32>, Array1<f32>) {
        let (message, gate, _) = self.neighbor_message_with_weights(i, x_flat, j, y);
        (message, gate)
    }

    fn neighbor_message_with_weights(
        &self,
        i: usize,
        x_flat: &Array2<f32>,
        j: usize,
        y: &Array3<f32>,
    ) -> (Array3<f32>, Array1<f32>, Array2<f32>) {
        let (c, h, w) = y.dim();
        let transformed = self.transform_neighbor(i, j, y);

        // Spatial cross-attention between node i and the transformed
        // neighbour, softmax over the neighbour's positions.
        let scores = x_flat.t().dot(&transformed);
        let attention = softmax_rows(&scores);
        let context = attention.dot(&transformed.t());

        let mut message = Array3::zeros((c, h, w));
        for pos in 0..h * w {
            for ch in 0..c {
                message[[ch, pos / w, pos % w]] = context[[pos, ch]];
            }
        }

        let gate = global_avg_pool(&self.inter_gate.forward(&message)).mapv(sigmoid);
        (message, gate, attention)
    }

    /// Edge-conditioned, direction-aware projection of a neighbour's
    /// feature map, flattened to (C, H·W).
    fn transform_neighbor(&self, i: usize, j: usize, y: &Array3<f32>) -> Array2<f32> {
        let (_, h, w) = y.dim();
        let conv = self.message.select(i, j);
        let projected = if self.config.with_edge_features {
            let edge = Self::edge_feature(i, j, h, w);
            let stacked =
                ndarray::concatenate(ndarray::Axis(0), &[y.view(), edge.view()]).expect("matching (H, W)");
            conv.forward(&stacked)
        } else {
            conv.forward(y)
        };
        self.inter_weight.forward_cols(&flatten_spatial(&projected))
    }
}

/// (C, H, W) → (C, H·W), row-major over spatial positions.
fn flatten_spatial(x: &Array3<f32>) -> Array2<f32> {
    let (c, h, w) = x.dim();
    x.to_owned()
        .into_shape_with_order((c, h * w))
        .expect("contiguous (C, H, W) volume")
}
