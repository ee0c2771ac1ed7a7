mod common;

use anyhow::Result;
use approx::assert_relative_eq;
use common::{load, scenario_config, scenario_graph, scenario_params, step, synth};
use inferforge::kernels::DType;
use inferforge::llm::fixtures::SynthOptions;
use inferforge::{Device, LlmError, LlmParams, UserConfig};

#[test]
fn prefill_then_decode_grows_the_cache() -> Result<()> {
    let mut graph = scenario_graph()?;
    step(&mut graph, &[5, 7, 9], 0, true)?;
    assert_eq!(graph.kv_lengths(), vec![3, 3]);

    let logits = step(&mut graph, &[11], 3, false)?;
    assert_eq!(graph.kv_lengths(), vec![4, 4]);
    assert_eq!(logits.len(), 32);
    assert!(logits.iter().all(|v| v.is_finite()));
    Ok(())
}

#[test]
fn replay_after_reset_is_bitwise_equal() -> Result<()> {
    let mut graph = scenario_graph()?;
    let first_prefill = step(&mut graph, &[5, 7, 9], 0, true)?;
    let first_decode = step(&mut graph, &[11], 3, false)?;

    graph.reset_ctx();
    assert_eq!(graph.kv_lengths(), vec![0, 0]);
    let second_prefill = step(&mut graph, &[5, 7, 9], 0, true)?;
    let second_decode = step(&mut graph, &[11], 3, false)?;

    assert_eq!(first_prefill, second_prefill);
    assert_eq!(first_decode, second_decode);
    Ok(())
}

#[test]
fn aliased_weight_resolves_to_canonical_name() -> Result<()> {
    let params = scenario_params();
    let options = SynthOptions {
        renames: vec![(
            "layers.1.attention.wq.weight".to_string(),
            "model.layers.1.self_attn.q_proj.weight".to_string(),
        )],
        ..SynthOptions::default()
    };
    let bytes = synth("llama", &params, &scenario_config(), &options)?;
    let graph = load("llama", &bytes, scenario_config(), Device::reference())?;

    let weight = graph
        .weights_map()
        .get("layers.1.attention.wq.weight")
        .expect("canonical name registered");
    assert_eq!(weight.tensor.shape(), vec![64, 64]);
    assert!(weight.tensor.is_materialized());
    assert!(!graph.weights_map().contains_key("model.layers.1.self_attn.q_proj.weight"));
    Ok(())
}

#[test]
fn int4_reorder_packs_and_matches_unpacked() -> Result<()> {
    let params = scenario_params();
    let options = SynthOptions {
        weight_dtype: DType::Int4,
        ..SynthOptions::default()
    };
    let bytes = synth("llama", &params, &scenario_config(), &options)?;

    // The parallel kernel advertises the reorder; the reference kernel does not.
    let mut packed = load("llama", &bytes, scenario_config(), Device::cpu())?;
    let mut plain = load("llama", &bytes, scenario_config(), Device::reference())?;

    let info = packed
        .matmul_info("layers.0.attention.wq.weight")
        .expect("wq is a matmul weight");
    assert!(info.weight_packed);
    assert_eq!((info.n, info.k), (64, 64));
    let tensor = packed.weight("layers.0.attention.wq.weight").expect("wq");
    assert_eq!(tensor.dtype(), DType::Int4Packed);
    assert_eq!(tensor.shape(), vec![8, 64]);

    let reference_info = plain
        .matmul_info("layers.0.attention.wq.weight")
        .expect("wq is a matmul weight");
    assert!(!reference_info.weight_packed);
    assert_eq!(reference_info.n, 64);

    let tokens = [5, 7, 9];
    let fast = step(&mut packed, &tokens, 0, true)?;
    let slow = step(&mut plain, &tokens, 0, true)?;
    for (a, b) in fast.iter().zip(&slow) {
        assert_relative_eq!(a, b, max_relative = 1e-2, epsilon = 1e-4);
    }
    Ok(())
}

#[test]
fn decode_past_the_context_is_rejected() -> Result<()> {
    let mut graph = scenario_graph()?;
    let prompt: Vec<i32> = (0..16).collect();
    step(&mut graph, &prompt, 0, true)?;
    assert_eq!(graph.kv_lengths(), vec![16, 16]);

    let mut logits = vec![0.0; 32];
    let err = graph.execute(&[3], &mut logits, 16, false);
    assert!(matches!(err, Err(LlmError::Config(_))));
    assert_eq!(graph.kv_lengths(), vec![16, 16]);
    Ok(())
}

#[test]
fn grouped_query_projection_and_cache_width() -> Result<()> {
    let params = LlmParams {
        n_layer: 2,
        ..LlmParams::tiny_glm2()
    };
    assert_eq!((params.n_head, params.n_kv_head(), params.n_embd), (8, 2, 64));
    let config = UserConfig::with_n_ctx(16);
    let bytes = synth("chatglm2", &params, &config, &SynthOptions::default())?;
    let mut graph = load("chatglm2", &bytes, config, Device::reference())?;

    let wqkv = graph.weight("layers.0.attention.wqkv.weight").expect("fused qkv");
    assert_eq!(wqkv.shape(), vec![96, 64]);
    let info = graph
        .matmul_info("layers.0.attention.wqkv.weight")
        .expect("projection info");
    assert_eq!(info.n, 64 + 2 * 2 * 8);

    // K and V rows are group · d_head = 16 floats each, per layer.
    assert_eq!(graph.kv_bytes_per_token(), params.n_layer * 2 * 16 * 4);

    let logits = step(&mut graph, &[1, 2, 3], 0, true)?;
    assert_eq!(logits.len(), params.n_vocab);
    step(&mut graph, &[4], 3, false)?;
    assert_eq!(graph.kv_lengths(), vec![4, 4]);
    Ok(())
}
