//! End-to-end tests of the engine contract: lifecycle, blocking calls and the
//! async completion protocol.

mod common;

use std::time::{Duration, Instant};

use futures::StreamExt;

use common::{assert_counts_to_three, Harness, COUNT_PROMPT, COUNT_PROMPT_ELI5, HERMES_SYSMSG};
use llm_rpc_shim::protocol::chatml::{self, format_chatml};
use llm_rpc_shim::protocol::{ChatMessage, CompletionRequest, CompletionUpdate, StopReason};
use llm_rpc_shim::session::calls::chat_content;
use llm_rpc_shim::session::AsyncPhase;
use llm_rpc_shim::Phase;

/// Updates after which the late-cancel test cancels.
const CANCEL_ON: usize = 30;

fn count_request() -> CompletionRequest {
    chatml::chat_request(Some(HERMES_SYSMSG), Some(COUNT_PROMPT_ELI5))
}

fn check_simple_completion(h: &mut Harness) -> String {
    let result = h
        .session
        .get_completion(&count_request())
        .unwrap()
        .into_result()
        .unwrap();
    assert_counts_to_three(&result.content);
    result.content
}

#[test]
fn test_load_unload_model() {
    let mut h = Harness::new();
    h.load_model(2048);
    assert_eq!(h.session.phase(), Phase::Ready);

    h.session.deinit().unwrap();
    let status = h.session.poll_system_status().unwrap();
    assert_eq!(status.init_success, 0);

    // Deinit is idempotent.
    h.session.deinit().unwrap();
    assert_eq!(h.session.poll_system_status().unwrap().init_success, 0);

    h.load_model(2048);
}

#[tokio::test]
async fn test_async_load_reports_progress() {
    let mut h = Harness::new();
    let request = h.init_request(2048);
    h.session.init_async(&request).unwrap();
    assert_eq!(h.session.phase(), Phase::Loading);

    let status = h.session.wait_until_loaded(&h.polling.clone()).await.unwrap();
    assert_eq!(status.init_success, 1);
    assert_eq!(status.loading_progress, 1.0);
    assert_eq!(status.model.as_deref(), Some(h.model.as_path()));
    assert_eq!(h.session.phase(), Phase::Ready);
}

#[test]
fn test_tokenize() {
    let mut h = Harness::loaded();
    let text = format_chatml(&[ChatMessage::user(COUNT_PROMPT_ELI5)], true);

    let result = h.session.tokenize(&text).unwrap().into_result().unwrap();
    assert!(result.success);
    assert_eq!(result.length, result.tokens.len());
    assert!(!result.tokens.is_empty());
}

#[test]
fn test_completion() {
    let mut h = Harness::loaded();
    check_simple_completion(&mut h);
}

#[test]
fn test_plain_count_prompt() {
    let mut h = Harness::loaded();
    let request = CompletionRequest::new(format_chatml(&[ChatMessage::user(COUNT_PROMPT)], true))
        .with_stop(chatml::IM_END)
        .deterministic(chatml::DEFAULT_SEED);
    let result = h.session.get_completion(&request).unwrap().into_result().unwrap();
    assert_counts_to_three(chatml::fix_chatml_markup(&result.content));
}

#[test]
fn test_chat_completion_over_rpc() {
    let mut h = Harness::loaded();
    let response = h
        .session
        .chat(vec![
            ChatMessage::system(HERMES_SYSMSG),
            ChatMessage::user(COUNT_PROMPT_ELI5),
        ])
        .unwrap()
        .into_result()
        .unwrap();
    let content = chat_content(&response).unwrap();
    assert_counts_to_three(chatml::fix_chatml_markup(content));
}

#[tokio::test]
async fn test_streaming_completion() {
    let mut h = Harness::loaded();
    let expected = check_simple_completion(&mut h);

    h.session
        .async_completion_init(&count_request())
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(h.session.async_phase(), AsyncPhase::Running);

    let started = Instant::now();
    let mut polls = Vec::new();
    let mut updates: Vec<CompletionUpdate> = Vec::new();

    loop {
        let poll = h.session.async_completion_poll().unwrap().into_result().unwrap();
        updates.extend(poll.completion_updates.iter().cloned());
        let finished = poll.finished;
        polls.push(poll);
        if finished {
            break;
        }
        tokio::time::sleep(h.polling.interval()).await;
        assert!(
            started.elapsed() < h.polling.timeout(),
            "Timeout waiting for completion"
        );
    }

    let last_poll = polls.last().unwrap();
    assert!(last_poll.finished);
    assert_eq!(last_poll.success, Some(true));

    let last = updates.last().unwrap();
    assert_eq!(last.content, "");
    assert_eq!(last.status, 200);
    assert!(last.stop);
    assert_eq!(last.stop_reason(), Some(StopReason::Eos));

    let output: String = updates.iter().map(|u| u.content.as_str()).collect();
    assert_counts_to_three(&output);
    assert_eq!(output, expected);
    assert_eq!(h.session.async_phase(), AsyncPhase::Idle);
}

#[tokio::test]
async fn test_streaming_completion_with_late_cancel() {
    let mut h = Harness::loaded();
    h.session
        .async_completion_init(&count_request())
        .unwrap()
        .into_result()
        .unwrap();

    let started = Instant::now();
    let mut received = 0;
    loop {
        let poll = h.session.async_completion_poll().unwrap().into_result().unwrap();
        received += poll.completion_updates.len();

        if received >= CANCEL_ON {
            h.session.async_completion_cancel().unwrap();
            break;
        }
        if poll.finished {
            break;
        }
        tokio::time::sleep(h.polling.interval()).await;
        assert!(
            started.elapsed() < h.polling.timeout(),
            "Timeout waiting for completion"
        );
    }

    // Waiting after the terminal poll is a no-op on an idle slot.
    h.session.wait_for_finish(&h.polling.clone()).await.unwrap();
    check_simple_completion(&mut h);
}

#[tokio::test]
async fn test_streaming_completion_with_early_cancel() {
    let mut h = Harness::loaded();
    h.session
        .async_completion_init(&count_request())
        .unwrap()
        .into_result()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    h.session.async_completion_cancel().unwrap();

    h.session.wait_for_finish(&h.polling.clone()).await.unwrap();
    assert_eq!(h.session.async_phase(), AsyncPhase::Idle);
    check_simple_completion(&mut h);
}

#[tokio::test]
async fn test_cancel_long_generation_terminates() {
    let mut h = Harness::loaded();
    let request = CompletionRequest::new("Write a very long story about a lighthouse.")
        .with_n_predict(100_000)
        .deterministic(chatml::DEFAULT_SEED);

    h.session
        .async_completion_init(&request)
        .unwrap()
        .into_result()
        .unwrap();
    h.session.async_completion_cancel().unwrap();
    assert_eq!(h.session.async_phase(), AsyncPhase::Cancelling);

    let outcome = h.session.wait_for_finish(&h.polling.clone()).await.unwrap();
    let terminal = outcome.terminal().unwrap();
    assert!(terminal.stop);
    assert_eq!(h.session.async_phase(), AsyncPhase::Idle);
}

#[tokio::test]
async fn test_second_async_init_is_rejected() {
    let mut h = Harness::loaded();
    let request = CompletionRequest::new("Tell me everything.").with_n_predict(100_000);

    assert!(!h.session.async_completion_init(&request).unwrap().is_rejected());
    assert!(h.session.async_completion_init(&request).unwrap().is_rejected());

    h.session.async_completion_cancel().unwrap();
    h.session.wait_for_finish(&h.polling.clone()).await.unwrap();
}

#[tokio::test]
async fn test_stream_matches_blocking_completion() {
    let mut h = Harness::loaded();
    let request = count_request();
    let expected = check_simple_completion(&mut h);
    let interval = h.polling.interval();
    let timeout = h.polling.timeout();

    let updates: Vec<CompletionUpdate> = {
        let stream = h
            .session
            .stream_completion(&request, interval)
            .unwrap()
            .into_result()
            .unwrap();
        tokio::time::timeout(timeout, stream.map(|u| u.unwrap()).collect())
            .await
            .unwrap()
    };

    let content: String = updates.iter().map(|u| u.content.as_str()).collect();
    assert_eq!(content, expected);
    assert!(updates.last().unwrap().is_terminal());
}

#[test]
fn test_calls_before_init_are_rejected_as_data() {
    let mut h = Harness::new();
    assert!(h.session.tokenize("hello").unwrap().is_rejected());
    assert!(h
        .session
        .get_completion(&CompletionRequest::new("hello"))
        .unwrap()
        .is_rejected());
}
