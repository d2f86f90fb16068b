use serde::Deserialize;

use candle_nn::Activation;

use crate::moe::{ExpertKind, GateKind, MoEError};

/// Construction parameters of an MoE transformer MLP.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MoEConfig {
    /// Experts held by each worker.
    pub num_expert: usize,
    pub d_model: usize,
    pub d_hidden: usize,
    /// Workers sharing the expert bank.
    pub world_size: usize,
    pub activation: String,
    pub gate: String,
    pub top_k: usize,
    /// Data-parallel communication tag of the expert parameters.
    pub expert_dp_comm: String,
    /// Expert implementation, `linear` or `conv`.
    pub expert: String,
    /// Conv expert only.
    pub kernel_size: usize,
    /// Conv expert only.
    pub dilation: usize,
}

impl Default for MoEConfig {
    fn default() -> Self {
        Self {
            num_expert: 32,
            d_model: 1024,
            d_hidden: 4096,
            world_size: 1,
            activation: "gelu".to_string(),
            gate: "naive".to_string(),
            top_k: 2,
            expert_dp_comm: "none".to_string(),
            expert: "linear".to_string(),
            kernel_size: 1,
            dilation: 1,
        }
    }
}

impl MoEConfig {
    /// Parse a JSON config; missing keys take their defaults.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn activation(&self) -> Result<Activation, MoEError> {
        match self.activation.as_str() {
            "gelu" => Ok(Activation::Gelu),
            "gelu_new" | "gelu_pytorch_tanh" => Ok(Activation::NewGelu),
            "relu" => Ok(Activation::Relu),
            "silu" | "swish" => Ok(Activation::Silu),
            "sigmoid" => Ok(Activation::Sigmoid),
            other => Err(MoEError::UnsupportedActivation(other.to_string())),
        }
    }

    pub fn expert_kind(&self) -> Result<ExpertKind, MoEError> {
        ExpertKind::parse(&self.expert, self.kernel_size, self.dilation)
    }

    pub fn gate_kind(&self) -> Result<GateKind, MoEError> {
        GateKind::parse(&self.gate)
    }

    pub fn dp_comm(&self) -> Result<DpComm, MoEError> {
        DpComm::parse(&self.expert_dp_comm)
    }

    /// Experts across all workers.
    pub fn total_experts(&self) -> usize {
        self.num_expert * self.world_size
    }
}

/// Group over which a parameter's gradients are synchronised.
///
/// Bookkeeping only; nothing in this crate communicates on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DpComm {
    /// Not synchronised.
    #[default]
    None,
    Dp,
    World,
    Mp,
    Gate,
}

impl DpComm {
    pub fn parse(name: &str) -> Result<Self, MoEError> {
        match name {
            "none" => Ok(Self::None),
            "dp" => Ok(Self::Dp),
            "world" => Ok(Self::World),
            "mp" => Ok(Self::Mp),
            "gate" => Ok(Self::Gate),
            other => Err(MoEError::UnsupportedDpComm(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Dp => "dp",
            Self::World => "world",
            Self::Mp => "mp",
            Self::Gate => "gate",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONV_CONFIG: &str = r#"{
        "num_expert": 4,
        "d_model": 16,
        "d_hidden": 64,
        "world_size": 2,
        "activation": "relu",
        "top_k": 1,
        "expert_dp_comm": "dp",
        "expert": "conv",
        "kernel_size": 3,
        "dilation": 2
    }"#;

    #[test]
    fn parse_conv_config() {
        let config = MoEConfig::from_json(CONV_CONFIG).expect("failed to parse config");

        assert_eq!(config.num_expert, 4);
        assert_eq!(config.d_model, 16);
        assert_eq!(config.d_hidden, 64);
        assert_eq!(config.total_experts(), 8);
        assert_eq!(config.top_k, 1);
        assert_eq!(config.gate, "naive");
        assert_eq!(config.activation().unwrap(), Activation::Relu);
        assert_eq!(config.dp_comm().unwrap(), DpComm::Dp);
        assert_eq!(
            config.expert_kind().unwrap(),
            ExpertKind::Conv {
                kernel_size: 3,
                dilation: 2
            }
        );
    }

    #[test]
    fn empty_object_uses_defaults() {
        let config: MoEConfig = serde_json::from_str("{}").expect("failed to parse config");
        assert_eq!(config, MoEConfig::default());
        assert_eq!(config.num_expert, 32);
        assert_eq!(config.d_hidden, 4096);
        assert_eq!(config.expert_kind().unwrap(), ExpertKind::Linear);
        assert_eq!(config.gate_kind().unwrap(), GateKind::Naive);
        assert_eq!(config.dp_comm().unwrap(), DpComm::None);
    }

    #[test]
    fn unknown_names_are_rejected() {
        let config = MoEConfig {
            activation: "tanh".to_string(),
            expert: "attention".to_string(),
            expert_dp_comm: "global".to_string(),
            ..MoEConfig::default()
        };
        assert!(matches!(
            config.activation(),
            Err(MoEError::UnsupportedActivation(_))
        ));
        assert!(matches!(
            config.expert_kind(),
            Err(MoEError::UnsupportedExpert(_))
        ));
        assert!(matches!(
            config.dp_comm(),
            Err(MoEError::UnsupportedDpComm(_))
        ));
    }

    #[test]
    fn dp_comm_names_roundtrip() {
        for comm in [DpComm::None, DpComm::Dp, DpComm::World, DpComm::Mp, DpComm::Gate] {
            assert_eq!(DpComm::parse(comm.as_str()).unwrap(), comm);
        }
    }
}
