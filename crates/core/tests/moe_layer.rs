//! Integration tests for the MoE transformer MLP.
//!
//! Everything runs on CPU with a single in-process worker; weights come from
//! a `VarMap` (random) or explicit tensors when two layers must agree.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use candle_core::{DType, Device, Tensor};
use candle_nn::{Activation, VarBuilder, VarMap};
use fmoe_core::{
    config::MoEConfig,
    distributed::single_worker,
    moe::{ExpertKind, MoEError, MoEExperts, MoETransformerMlp, TokenMask},
};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar()
        .unwrap()
}

fn tiny_config() -> MoEConfig {
    serde_json::from_str(
        r#"{
            "num_expert": 2,
            "d_model": 8,
            "d_hidden": 16,
            "top_k": 2
        }"#,
    )
    .expect("failed to parse config")
}

/// Random expert bank with weights kept alive by the returned `VarMap`.
fn random_experts(kind: ExpertKind, num_expert: usize, d_model: usize) -> (VarMap, MoEExperts) {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let experts =
        MoEExperts::new(kind, num_expert, d_model, 2 * d_model, Activation::Gelu, vb).unwrap();
    (varmap, experts)
}

/// Parameters for a linear MLP and the equivalent 1x1 conv MLP.
fn paired_weights(
    config: &MoEConfig,
    device: &Device,
) -> (HashMap<String, Tensor>, HashMap<String, Tensor>) {
    let (e, d, h) = (config.num_expert, config.d_model, config.d_hidden);
    let up_w = Tensor::randn(0f32, 0.3, (e, h, d), device).unwrap();
    let up_b = Tensor::randn(0f32, 0.1, (e, h), device).unwrap();
    let down_w = Tensor::randn(0f32, 0.3, (e, d, h), device).unwrap();
    let down_b = Tensor::randn(0f32, 0.1, (e, d), device).unwrap();
    let gate_w = Tensor::randn(0f32, 1.0, (config.total_experts(), d), device).unwrap();
    let gate_b = Tensor::zeros(config.total_experts(), DType::F32, device).unwrap();

    let mut linear = HashMap::new();
    linear.insert("gate.weight".to_string(), gate_w.clone());
    linear.insert("gate.bias".to_string(), gate_b.clone());
    linear.insert("experts.htoh4.weight".to_string(), up_w.clone());
    linear.insert("experts.htoh4.bias".to_string(), up_b.clone());
    linear.insert("experts.h4toh.weight".to_string(), down_w.clone());
    linear.insert("experts.h4toh.bias".to_string(), down_b.clone());

    let mut conv = HashMap::new();
    conv.insert("gate.weight".to_string(), gate_w);
    conv.insert("gate.bias".to_string(), gate_b);
    for i in 0..e {
        conv.insert(
            format!("experts.htoh4.experts.{i}.weight"),
            up_w.get(i).unwrap().unsqueeze(2).unwrap(),
        );
        conv.insert(
            format!("experts.htoh4.experts.{i}.bias"),
            up_b.get(i).unwrap(),
        );
        conv.insert(
            format!("experts.h4toh.experts.{i}.weight"),
            down_w.get(i).unwrap().unsqueeze(2).unwrap(),
        );
        conv.insert(
            format!("experts.h4toh.experts.{i}.bias"),
            down_b.get(i).unwrap(),
        );
    }
    (linear, conv)
}

// ─── Wrapper ─────────────────────────────────────────────────────────────────

#[test]
fn shape_roundtrip() {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let mlp = MoETransformerMlp::new(&tiny_config(), single_worker(), vb).unwrap();

    let inp = Tensor::randn(0f32, 1.0, (2, 3, 8), &device).unwrap();
    let out = mlp.forward(&inp, None).unwrap();
    assert_eq!(out.dims(), &[2, 3, 8]);
}

#[test]
fn empty_batch_keeps_leading_shape() {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let mlp = MoETransformerMlp::new(&tiny_config(), single_worker(), vb).unwrap();

    let inp = Tensor::zeros((0, 3, 8), DType::F32, &device).unwrap();
    let out = mlp.forward(&inp, None).unwrap();
    assert_eq!(out.dims(), &[0, 3, 8]);
}

#[test]
fn absent_gate_input_routes_on_tokens() {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let mlp = MoETransformerMlp::new(&tiny_config(), single_worker(), vb).unwrap();

    let inp = Tensor::randn(0f32, 1.0, (2, 3, 8), &device).unwrap();
    let implicit = mlp.forward(&inp, None).unwrap();
    let explicit = mlp.forward(&inp, Some(&inp)).unwrap();
    assert!(max_abs_diff(&implicit, &explicit) < 1e-6);
}

#[test]
fn gate_hook_sees_auxiliary_routing() {
    let device = Device::Cpu;
    let config = tiny_config();
    let (linear, _) = paired_weights(&config, &device);
    let vb = VarBuilder::from_tensors(linear, DType::F32, &device);

    let seen = Arc::new(Mutex::new(Vec::<Vec<Vec<u32>>>::new()));
    let sink = seen.clone();
    let mlp = MoETransformerMlp::new(&config, single_worker(), vb)
        .unwrap()
        .with_gate_hook(Arc::new(move |ids: &Tensor, _scores: &Tensor| {
            sink.lock().unwrap().push(ids.to_vec2().unwrap());
        }));

    let inp = Tensor::randn(0f32, 1.0, (2, 2, 8), &device).unwrap();
    let gate_inp = Tensor::randn(0f32, 1.0, (2, 2, 8), &device).unwrap();
    let out = mlp.forward(&inp, Some(&gate_inp)).unwrap();
    assert_eq!(out.dims(), &[2, 2, 8]);

    // top_k equals the expert count, so every token visits both experts.
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].len(), 4);
    for ids in &seen[0] {
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1]);
    }
}

#[test]
fn linear_and_conv_layers_agree() {
    let device = Device::Cpu;
    let config = tiny_config();
    let conv_config = MoEConfig {
        expert: "conv".to_string(),
        ..config.clone()
    };
    let (linear, conv) = paired_weights(&config, &device);

    let linear_mlp = MoETransformerMlp::new(
        &config,
        single_worker(),
        VarBuilder::from_tensors(linear, DType::F32, &device),
    )
    .unwrap();
    let conv_mlp = MoETransformerMlp::new(
        &conv_config,
        single_worker(),
        VarBuilder::from_tensors(conv, DType::F32, &device),
    )
    .unwrap();

    let inp = Tensor::randn(0f32, 1.0, (3, 5, 8), &device).unwrap();
    let a = linear_mlp.forward(&inp, None).unwrap();
    let b = conv_mlp.forward(&inp, None).unwrap();
    assert!(max_abs_diff(&a, &b) < 1e-4);
}

#[test]
fn masked_tokens_bypass_experts() {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let fill = Tensor::full(0.5f32, 8, &device).unwrap();
    let mask = TokenMask::new(vec![0, 0, 1, 0, 0, 0], HashMap::from([(1, fill)])).unwrap();
    let mlp = MoETransformerMlp::new(&tiny_config(), single_worker(), vb)
        .unwrap()
        .with_mask(mask);

    let inp = Tensor::randn(0f32, 1.0, (2, 3, 8), &device).unwrap();
    let out = mlp.forward(&inp, None).unwrap();
    let masked = out.get(0).unwrap().get(2).unwrap();
    let expected = Tensor::full(0.5f32, 8, &device).unwrap();
    assert!(max_abs_diff(&masked, &expected) < 1e-5);
}

#[test]
fn unsupported_expert_selector() {
    let device = Device::Cpu;
    let config = MoEConfig {
        expert: "moe_attention".to_string(),
        ..tiny_config()
    };
    let result =
        MoETransformerMlp::new(&config, single_worker(), VarBuilder::zeros(DType::F32, &device));
    assert!(matches!(result, Err(MoEError::UnsupportedExpert(_))));
}

// ─── Expert banks ────────────────────────────────────────────────────────────

#[test]
fn expert_output_order_matches_grouped_input() {
    let device = Device::Cpu;
    let (_varmap, experts) = random_experts(ExpertKind::Linear, 2, 4);
    let tokens = Tensor::randn(0f32, 1.0, (4, 4), &device).unwrap();

    // t0, t1 -> expert 0; t2, t3 -> expert 1
    let out = experts.forward(&tokens, &[2, 2]).unwrap();
    assert_eq!(out.dims(), &[4, 4]);

    for (row, counts) in [(0, [1, 0]), (1, [1, 0]), (2, [0, 1]), (3, [0, 1])] {
        let single = tokens.narrow(0, row, 1).unwrap();
        let expected = experts.forward(&single, &counts).unwrap();
        let got = out.narrow(0, row, 1).unwrap();
        assert!(max_abs_diff(&got, &expected) < 1e-5, "row {row}");
    }
}

#[test]
fn zero_count_expert_is_a_noop() {
    let device = Device::Cpu;
    for kind in [
        ExpertKind::Linear,
        ExpertKind::Conv {
            kernel_size: 1,
            dilation: 1,
        },
    ] {
        let (_varmap, experts) = random_experts(kind, 3, 4);
        let tokens = Tensor::randn(0f32, 1.0, (5, 4), &device).unwrap();

        let spread = experts.forward(&tokens, &[2, 1, 2]).unwrap();
        // Expert 1's token moves to expert 2; expert 0's rows are untouched.
        let moved = experts.forward(&tokens, &[2, 0, 3]).unwrap();
        assert_eq!(moved.dims(), &[5, 4]);
        assert!(
            max_abs_diff(
                &spread.narrow(0, 0, 2).unwrap(),
                &moved.narrow(0, 0, 2).unwrap()
            ) < 1e-5
        );
        assert!(
            max_abs_diff(
                &spread.narrow(0, 3, 2).unwrap(),
                &moved.narrow(0, 3, 2).unwrap()
            ) < 1e-5
        );
    }
}

#[test]
fn count_sum_short_by_one_is_rejected() {
    let device = Device::Cpu;
    let (_varmap, experts) = random_experts(ExpertKind::Linear, 2, 4);
    let tokens = Tensor::randn(0f32, 1.0, (4, 4), &device).unwrap();

    assert!(matches!(
        experts.forward(&tokens, &[2, 1]),
        Err(MoEError::CountSumMismatch {
            expected: 4,
            actual: 3
        })
    ));
    assert!(matches!(
        experts.forward(&tokens, &[4]),
        Err(MoEError::CountLengthMismatch {
            expected: 2,
            actual: 1
        })
    ));
}
