//! Contract tests for the runtime seam, driven through `MockRuntime`.
//!
//! Helpers are generic over `InferenceRuntime` so they only use the trait
//! surface a worker would use.

use std::path::Path;

use llama_engine::mock::{MockRuntime, ScriptEnd};
use llama_engine::{
    Batch, ContextParams, InferenceRuntime, ModelParams, RuntimeError, SamplerChain, TokenId,
};

fn tokenize_all<R: InferenceRuntime>(rt: &R, model: &R::Model, text: &str, add_special: bool) -> Vec<TokenId> {
    let mut buf = vec![0; 4];
    let mut n = rt.tokenize(model, text, add_special, &mut buf);
    if n < 0 {
        buf.resize((-n) as usize, 0);
        n = rt.tokenize(model, text, add_special, &mut buf);
    }
    buf.truncate(n as usize);
    buf
}

fn piece<R: InferenceRuntime>(rt: &R, model: &R::Model, token: TokenId) -> Vec<u8> {
    let mut buf = vec![0u8; 2];
    let mut n = rt.token_to_piece(model, token, &mut buf);
    if n < 0 {
        buf.resize((-n) as usize, 0);
        n = rt.token_to_piece(model, token, &mut buf);
    }
    buf.truncate(n as usize);
    buf
}

/// Prompt, then sample until EOG/invalid or `max` tokens. Returns raw bytes and count.
fn run_turn<R: InferenceRuntime>(
    rt: &R,
    model: &R::Model,
    ctx: &mut R::Context,
    sampler: &mut R::Sampler,
    prompt: &[TokenId],
    start: usize,
    max: usize,
) -> (Vec<u8>, usize) {
    let n_vocab = rt.model_metadata(model).n_vocab;
    rt.decode(ctx, &Batch::prompt(prompt, start).unwrap()).unwrap();
    let mut pos = start + prompt.len();
    let mut bytes = Vec::new();
    let mut count = 0;
    while count < max {
        let tok = rt.sample(sampler, ctx);
        if rt.is_end_of_generation(model, tok) || tok < 0 || tok >= n_vocab {
            break;
        }
        bytes.extend(piece(rt, model, tok));
        count += 1;
        if rt.decode(ctx, &Batch::single(tok, pos)).is_err() {
            break;
        }
        pos += 1;
    }
    (bytes, count)
}

fn load(rt: &MockRuntime) -> (
    <MockRuntime as InferenceRuntime>::Model,
    <MockRuntime as InferenceRuntime>::Context,
    <MockRuntime as InferenceRuntime>::Sampler,
) {
    let model = rt
        .load_model(Path::new("tiny-q4_0.gguf"), &ModelParams::default())
        .unwrap();
    let ctx = rt.create_context(&model, &ContextParams::default()).unwrap();
    let sampler = rt.create_sampler(&model, &SamplerChain::default()).unwrap();
    (model, ctx, sampler)
}

#[test]
fn tokenize_retry_contract() {
    let rt = MockRuntime::new();
    let (model, _ctx, _sampler) = load(&rt);
    let tokens = tokenize_all(&rt, &model, "hello world", true);
    assert_eq!(tokens.len(), 12);

    let calls = rt.tokenize_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].capacity, 4);
    assert_eq!(calls[0].required, 12);
    assert_eq!(calls[1].capacity, 12);
    assert!(calls.iter().all(|c| c.add_special));
}

#[test]
fn piece_reports_required_size() {
    let rt = MockRuntime::new();
    let (model, _ctx, _sampler) = load(&rt);
    let eog: TokenId = llama_tokenizer::BYTE_EOG;
    assert_eq!(piece(&rt, &model, eog), b"<|im_end|>");
}

#[test]
fn multi_turn_positions_continue() {
    let rt = MockRuntime::new().with_reply("one two");
    let (model, mut ctx, mut sampler) = load(&rt);

    let first = tokenize_all(&rt, &model, "hi", true);
    let (bytes, n) = run_turn(&rt, &model, &mut ctx, &mut sampler, &first, 0, 64);
    assert_eq!(bytes, b"one two");
    assert_eq!(n, 2);
    let pos = first.len() + n;
    assert_eq!(ctx.n_past(), pos);

    let second = tokenize_all(&rt, &model, "again", false);
    let (bytes, _) = run_turn(&rt, &model, &mut ctx, &mut sampler, &second, pos, 64);
    assert_eq!(bytes, b"one two");
}

#[test]
fn split_code_point_arrives_over_two_pieces() {
    let rt = MockRuntime::new().with_pieces([&b"caf\xC3"[..], &b"\xA9"[..]]);
    let (model, mut ctx, mut sampler) = load(&rt);
    let (bytes, n) = run_turn(&rt, &model, &mut ctx, &mut sampler, &[1, 2], 0, 16);
    assert_eq!(n, 2);
    assert_eq!(String::from_utf8(bytes).unwrap(), "café");
}

#[test]
fn never_ending_script_is_bounded_by_caller() {
    let rt = MockRuntime::new().with_reply("la ").with_end(ScriptEnd::Never);
    let (model, mut ctx, mut sampler) = load(&rt);
    let (_, n) = run_turn(&rt, &model, &mut ctx, &mut sampler, &[1], 0, 10);
    assert_eq!(n, 10);
}

#[test]
fn invalid_token_ends_turn() {
    let rt = MockRuntime::new().with_reply("x").with_end(ScriptEnd::InvalidToken);
    let (model, mut ctx, mut sampler) = load(&rt);
    let (bytes, n) = run_turn(&rt, &model, &mut ctx, &mut sampler, &[1], 0, 10);
    assert_eq!(bytes, b"x");
    assert_eq!(n, 1);
}

#[test]
fn generation_decode_failure_after_steps() {
    let rt = MockRuntime::new().with_reply("a b c d e");
    rt.configure(|c| c.fail_generation_decode_after = Some(2));
    let (model, mut ctx, mut sampler) = load(&rt);
    let (bytes, n) = run_turn(&rt, &model, &mut ctx, &mut sampler, &[1], 0, 10);
    // third token is sampled, then its decode fails
    assert_eq!(n, 3);
    assert_eq!(bytes, b"a b c ");
    assert_eq!(ctx.n_past(), 3);
}

#[test]
fn perf_counters_split_prompt_and_generation() {
    let rt = MockRuntime::new().with_reply("a b");
    let (model, mut ctx, mut sampler) = load(&rt);
    run_turn(&rt, &model, &mut ctx, &mut sampler, &[1, 2, 3, 4], 0, 10);
    let perf = rt.performance_counters(&ctx);
    assert_eq!(perf.tokens_in, 4);
    assert_eq!(perf.tokens_out, 2);
}

#[test]
fn clear_cache_resets_position() {
    let rt = MockRuntime::new();
    let (model, mut ctx, mut sampler) = load(&rt);
    run_turn(&rt, &model, &mut ctx, &mut sampler, &[1, 2], 0, 3);
    rt.clear_cache(&mut ctx);
    assert_eq!(ctx.n_past(), 0);
    assert!(rt.decode(&mut ctx, &Batch::prompt(&[5], 0).unwrap()).is_ok());
}

#[test]
fn invalid_sampler_chain_is_rejected() {
    let rt = MockRuntime::new();
    let (model, _ctx, _sampler) = load(&rt);
    let chain = SamplerChain::new().with_temperature(0.5);
    assert!(matches!(
        rt.create_sampler(&model, &chain),
        Err(RuntimeError::SamplerCreation(_))
    ));
}

#[test]
fn context_failure_is_injectable() {
    let rt = MockRuntime::new();
    rt.configure(|c| c.fail_context = true);
    let model = rt
        .load_model(Path::new("m.gguf"), &ModelParams::default())
        .unwrap();
    assert!(matches!(
        rt.create_context(&model, &ContextParams::default()),
        Err(RuntimeError::ContextCreation(_))
    ));
    assert_eq!(rt.live_handles().contexts, 0);
}
