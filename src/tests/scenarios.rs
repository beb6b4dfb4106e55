use super::helpers::*;
use crate::{
    config::RuntimeConfig,
    constants::{RESULT_QUEUE, TASK_QUEUE},
    context::ContextStore,
    manager::TaskManager,
    models::{FinishReason, TaskRequest},
    queue,
    registry::InstanceRegistry,
    runtime::AgentRuntime,
    service::dto::{ChatCompletionMessage, ChatCompletionRequest},
    store::{AgentConfigStore, InMemoryAgentConfigStore},
    templates::{EchoTemplate, TemplateRegistry},
    RuntimeError,
};
use futures::StreamExt;
use std::{sync::Arc, time::Duration};

fn completion_request(model: &str, content: &str, session: Option<&str>) -> ChatCompletionRequest {
    ChatCompletionRequest {
        model: model.to_string(),
        messages: vec![ChatCompletionMessage {
            role: "user".to_string(),
            content: content.to_string(),
        }],
        temperature: None,
        max_tokens: None,
        stream: false,
        session_id: session.map(str::to_string),
        priority: None,
        metadata: Default::default(),
    }
}

#[tokio::test]
async fn single_turn_mints_session_and_reuses_instance() {
    let runtime = echo_runtime(2).await;

    let response = runtime
        .service
        .complete(completion_request("echo", "ping", None))
        .await
        .unwrap();

    assert_eq!(response.choices[0].message.role, "assistant");
    assert!(!response.choices[0].message.content.is_empty());
    assert_eq!(response.choices[0].finish_reason.as_deref(), Some("stop"));
    let session = response.metadata["session_id"].as_str().unwrap().to_string();

    let before = runtime.manager.stats().await.unwrap().active_instances;
    assert_eq!(before, 1);

    runtime
        .service
        .complete(completion_request("echo", "again", Some(&session)))
        .await
        .unwrap();

    let after = runtime.manager.stats().await.unwrap().active_instances;
    assert_eq!(after, before);

    runtime.shutdown().await;
}

#[tokio::test]
async fn streamed_chunks_reassemble_to_single_shot_content() {
    let runtime = echo_runtime(2).await;
    let manager = &runtime.manager;

    let single = {
        let request = TaskRequest::new("echo", vec![user("hello streaming world")])
            .with_session("single");
        let task_id = manager.submit_task(request).await.unwrap();
        manager
            .wait_result(&task_id, Duration::from_secs(2))
            .await
            .unwrap()
    };
    assert!(single.success);
    let expected = single.message.unwrap().content;

    let request = TaskRequest::new("echo", vec![user("hello streaming world")])
        .with_session("streamed")
        .with_stream(true);
    let task_id = manager.submit_task(request).await.unwrap();
    let mut stream = manager.subscribe_stream(&task_id).await.unwrap();

    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next().await {
        chunks.push(chunk);
    }

    assert!(!chunks.is_empty());
    let (terminal, deltas) = chunks.split_last().unwrap();
    assert_eq!(terminal.finish_reason, Some(FinishReason::Stop));
    assert!(deltas.iter().all(|c| c.finish_reason.is_none()));
    for (expected_index, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.chunk_index, expected_index as u64);
    }

    let assembled: String = chunks.iter().map(|c| c.content.as_str()).collect();
    assert_eq!(assembled, expected);

    runtime.shutdown().await;
}

#[tokio::test]
async fn same_session_tasks_execute_serially() {
    let runtime = AgentRuntime::start(test_config(4)).await.unwrap();
    let template = Arc::new(RecordingTemplate::new(Duration::from_millis(80)));
    let spans = template.spans.clone();
    add_agent(&runtime, template, "rec").await;

    let first = {
        let manager = runtime.manager.clone();
        tokio::spawn(async move {
            let request = TaskRequest::new("rec", vec![user("one")]).with_session("shared");
            let task_id = manager.submit_task(request).await.unwrap();
            manager.wait_result(&task_id, Duration::from_secs(3)).await
        })
    };
    let second = {
        let manager = runtime.manager.clone();
        tokio::spawn(async move {
            let request = TaskRequest::new("rec", vec![user("two")]).with_session("shared");
            let task_id = manager.submit_task(request).await.unwrap();
            manager.wait_result(&task_id, Duration::from_secs(3)).await
        })
    };

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert!(first.success && second.success);
    assert_ne!(first.task_id, second.task_id);

    // The second execution begins at or after the first ends.
    let mut spans = spans.lock().unwrap().clone();
    assert_eq!(spans.len(), 2);
    spans.sort_by_key(|(start, _)| *start);
    assert!(spans[0].1 <= spans[1].0);

    runtime.shutdown().await;
}

#[tokio::test]
async fn idle_instances_are_reclaimed_and_recreated() {
    let config = RuntimeConfig {
        instance_timeout_seconds: 0,
        ..test_config(2)
    };
    let runtime = AgentRuntime::start(config).await.unwrap();
    runtime.seed_default_agent().await.unwrap();

    runtime
        .service
        .complete(completion_request("echo", "warm up", Some("s_idle")))
        .await
        .unwrap();

    let instances = runtime.manager.list_instances().await;
    assert_eq!(instances.len(), 1);
    let first_created = instances[0].created_at;

    tokio::time::sleep(Duration::from_millis(50)).await;
    runtime.manager.sweep_now().await;
    assert!(runtime.manager.list_instances().await.is_empty());

    runtime
        .service
        .complete(completion_request("echo", "fresh", Some("s_idle")))
        .await
        .unwrap();

    let instances = runtime.manager.list_instances().await;
    assert_eq!(instances.len(), 1);
    assert!(instances[0].created_at > first_created);

    runtime.shutdown().await;
}

#[tokio::test]
async fn saturated_task_queue_rejects_submission_synchronously() {
    // No workers: components assembled by hand, manager never started.
    let mut config = test_config(1);
    config.mq.max_queue_size = 1;
    let config = Arc::new(config);

    let queue = queue::build(&config.mq).unwrap();
    let templates = Arc::new(TemplateRegistry::new());
    templates.register(Arc::new(EchoTemplate::new())).await.unwrap();
    let configs: Arc<dyn AgentConfigStore> = Arc::new(InMemoryAgentConfigStore::new());
    let contexts = Arc::new(ContextStore::new(config.max_history));
    let registry = Arc::new(InstanceRegistry::new(templates, configs));
    let manager = TaskManager::new(queue.clone(), registry, contexts, config.clone());

    queue
        .create_queue(TASK_QUEUE, Some(config.mq.max_queue_size))
        .await
        .unwrap();
    queue.create_queue(RESULT_QUEUE, None).await.unwrap();

    let first = TaskRequest::new("echo", vec![user("one")]);
    manager.submit_task(first).await.unwrap();

    let second = TaskRequest::new("echo", vec![user("two")]);
    let error = manager.submit_task(second).await.unwrap_err();
    assert!(matches!(error, RuntimeError::QueueSaturated));
}

#[tokio::test]
async fn executor_failure_is_reported_and_does_not_poison_instance() {
    let runtime = AgentRuntime::start(test_config(2)).await.unwrap();
    add_agent(&runtime, Arc::new(FlakyTemplate::new()), "flaky").await;
    let manager = &runtime.manager;

    let request = TaskRequest::new("flaky", vec![user("please explode")]).with_session("s1");
    let task_id = manager.submit_task(request).await.unwrap();
    let result = manager
        .wait_result(&task_id, Duration::from_secs(2))
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.finish_reason, FinishReason::Error);
    let error = result.error.unwrap();
    assert!(error.contains("detonated"));
    assert_eq!(
        result.metadata.get("error").and_then(|v| v.as_str()),
        Some(error.as_str())
    );

    // Same session recovers on the next submission.
    let request = TaskRequest::new("flaky", vec![user("behave")]).with_session("s1");
    let task_id = manager.submit_task(request).await.unwrap();
    let result = manager
        .wait_result(&task_id, Duration::from_secs(2))
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(manager.stats().await.unwrap().active_instances, 1);

    runtime.shutdown().await;
}

#[tokio::test]
async fn stream_consumer_disconnect_releases_the_instance() {
    let runtime = echo_runtime(2).await;
    runtime
        .service
        .create_agent(crate::service::dto::CreateAgentRequest {
            id: Some("drip".to_string()),
            name: "Drip".to_string(),
            template_id: "echo".to_string(),
            template_version: None,
            configuration: [(
                "delay_ms".to_string(),
                serde_json::json!(2),
            )]
            .into_iter()
            .collect(),
            metadata: Default::default(),
        })
        .await
        .unwrap();
    let manager = &runtime.manager;

    let long_input = "word ".repeat(500);
    let request = TaskRequest::new("drip", vec![user(long_input.trim())])
        .with_session("s1")
        .with_stream(true);
    let task_id = manager.submit_task(request).await.unwrap();

    let mut stream = manager.subscribe_stream(&task_id).await.unwrap();
    let first = stream.next().await.unwrap();
    assert!(first.finish_reason.is_none());
    drop(stream);

    // The worker notices the closed stream queue and frees the instance; a
    // follow-up task on the same session completes promptly.
    let request = TaskRequest::new("drip", vec![user("after cancel")]).with_session("s1");
    let task_id = manager.submit_task(request).await.unwrap();
    let result = manager
        .wait_result(&task_id, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(result.success);

    runtime.shutdown().await;
}

#[tokio::test]
async fn expired_deadline_reports_length_with_timeout_marker() {
    let runtime = AgentRuntime::start(test_config(2)).await.unwrap();
    add_agent(
        &runtime,
        Arc::new(RecordingTemplate::new(Duration::from_secs(10))),
        "slow",
    )
    .await;

    let mut request = TaskRequest::new("slow", vec![user("take your time")]);
    request.timeout_seconds = 1;
    let task_id = runtime.manager.submit_task(request).await.unwrap();
    let result = runtime
        .manager
        .wait_result(&task_id, Duration::from_secs(5))
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.finish_reason, FinishReason::Length);
    assert_eq!(
        result.metadata.get("timeout"),
        Some(&serde_json::Value::Bool(true))
    );

    runtime.shutdown().await;
}

#[tokio::test]
async fn submit_validation_and_wait_timeout_fail_fast() {
    let runtime = echo_runtime(1).await;

    let error = runtime
        .manager
        .submit_task(TaskRequest::new("echo", vec![]))
        .await
        .unwrap_err();
    assert!(matches!(error, RuntimeError::Validation(_)));

    let error = runtime
        .manager
        .wait_result("no-such-task", Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(error, RuntimeError::Timeout { .. }));

    runtime.shutdown().await;
}

#[tokio::test]
async fn conversation_history_grows_across_turns() {
    let runtime = echo_runtime(1).await;

    runtime
        .service
        .complete(completion_request("echo", "first", Some("s_hist")))
        .await
        .unwrap();
    runtime
        .service
        .complete(completion_request("echo", "second", Some("s_hist")))
        .await
        .unwrap();

    let key = crate::models::SessionKey::new("echo", Some("s_hist".to_string()));
    let history = runtime.contexts.history(&key).await;
    // Two user turns and two assistant turns.
    assert_eq!(history.len(), 4);
    assert_eq!(history[0].content, "first");
    assert_eq!(history[1].content, "first");
    assert_eq!(history[2].content, "second");

    runtime.shutdown().await;
}
