use candle_core::{Result as CandleResult, Tensor};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Activation {
    Gelu,
    Relu,
    Silu,
}

impl Activation {
    /// Maps a `hidden_act` name from a model config.
    pub fn parse(name: &str) -> CandleResult<Self> {
        match name {
            "gelu" => Ok(Activation::Gelu),
            "relu" => Ok(Activation::Relu),
            "silu" | "swish" => Ok(Activation::Silu),
            _ => Err(candle_core::Error::Msg(format!(
                "Unsupported activation function: {}",
                name
            ))),
        }
    }

    pub fn apply(&self, input: &Tensor) -> CandleResult<Tensor> {
        match self {
            Activation::Gelu => input.gelu(),
            Activation::Relu => input.relu(),
            Activation::Silu => input.silu(),
        }
    }
}
