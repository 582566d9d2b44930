//! Llama-family causal language model built from the primitives in `layers`.

pub mod causal_self_attention;
pub mod decoder;
pub mod inference;
pub mod mlp;
pub mod models;
