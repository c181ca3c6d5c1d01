//! Tool registration, invocation round-trips, rollback, and counters.

mod common;

use std::time::Duration;

use common::{eventually, ServerHarness};
use emcp_core::Error;
use emcp_server::{ServerConfig, ToolEvent, ToolMessage, ToolMetadata, ToolRecord, TransportMessage};
use emcp_test::{
    ping_request, tools_call_request, tools_list_request, CooperativeSleeper, FailingTool,
    ManualTool, ReplyTool,
};
use serde_json::json;

fn metadata(name: &str) -> ToolMetadata {
    ToolMetadata::new(name, json!({"type": "object"}))
}

#[tokio::test]
async fn duplicate_tool_registration_is_refused() {
    let harness = ServerHarness::new();
    let (tool, _captures) = ManualTool::new();

    harness
        .handle
        .add_tool(ToolRecord::new(metadata("dup"), tool.clone()))
        .unwrap();
    let err = harness
        .handle
        .add_tool(ToolRecord::new(metadata("dup"), tool))
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)));

    // The first registration is still listed.
    let transport = harness.connected_client().await;
    harness
        .handle
        .handle_request(
            &transport.binding(),
            TransportMessage {
                msg_id: 100,
                json: tools_list_request(10),
            },
        )
        .await
        .unwrap();
    let reply = transport.expect_message().await.value();
    let tools = reply["result"]["tools"].as_array().unwrap().clone();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["name"], "dup");
}

#[tokio::test]
async fn tool_registry_capacity_boundary() {
    let config = ServerConfig {
        max_tools: 2,
        ..ServerConfig::default()
    };
    let harness = ServerHarness::with_config(config);
    let (tool, _captures) = ManualTool::new();

    harness
        .handle
        .add_tool(ToolRecord::new(metadata("a"), tool.clone()))
        .unwrap();
    harness
        .handle
        .add_tool(ToolRecord::new(metadata("b"), tool.clone()))
        .unwrap();
    let err = harness
        .handle
        .add_tool(ToolRecord::new(metadata("c"), tool))
        .unwrap_err();
    assert!(matches!(err, Error::NoSpace(_)));
}

#[tokio::test]
async fn tools_list_reports_metadata() {
    let harness = ServerHarness::new();
    let (tool, _captures) = ManualTool::new();
    harness
        .handle
        .add_tool(ToolRecord::new(
            metadata("probe")
                .with_title("Probe")
                .with_description("Reads a sensor")
                .with_output_schema(json!({"type": "object"})),
            tool,
        ))
        .unwrap();

    let transport = harness.connected_client().await;
    harness
        .handle
        .handle_request(
            &transport.binding(),
            TransportMessage {
                msg_id: 100,
                json: tools_list_request(4),
            },
        )
        .await
        .unwrap();
    let reply = transport.expect_message().await.value();
    let tool = &reply["result"]["tools"][0];
    assert_eq!(tool["name"], "probe");
    assert_eq!(tool["title"], "Probe");
    assert_eq!(tool["description"], "Reads a sensor");
    assert_eq!(tool["inputSchema"]["type"], "object");
    assert_eq!(tool["outputSchema"]["type"], "object");
}

#[tokio::test]
async fn tool_call_round_trip() {
    let harness = ServerHarness::new();
    harness
        .handle
        .add_tool(ToolRecord::new(
            metadata("echo"),
            ReplyTool::new(harness.handle.clone(), "ok"),
        ))
        .unwrap();

    let transport = harness.connected_client().await;
    harness
        .handle
        .handle_request(
            &transport.binding(),
            TransportMessage {
                msg_id: 107,
                json: tools_call_request(7, "echo", json!({"x": 1})),
            },
        )
        .await
        .unwrap();

    let reply = transport.expect_message().await.value();
    assert_eq!(reply["id"], 7);
    assert_eq!(reply["result"]["content"][0]["type"], "text");
    assert_eq!(reply["result"]["content"][0]["text"], "ok");
    assert_eq!(reply["result"]["isError"], false);

    // Activity counter and active-request count drain back to zero: the
    // tool becomes removable.
    assert!(eventually(|| harness.handle.remove_tool("echo").is_ok()).await);
}

#[tokio::test]
async fn arguments_reach_the_callback_verbatim() {
    let harness = ServerHarness::new();
    let (tool, mut captures) = ManualTool::new();
    harness
        .handle
        .add_tool(ToolRecord::new(metadata("capture"), tool))
        .unwrap();

    let transport = harness.connected_client().await;
    harness
        .handle
        .handle_request(
            &transport.binding(),
            TransportMessage {
                msg_id: 100,
                // Hand-written JSON keeps inner spacing intact.
                json: r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"capture","arguments":{"a": [1, 2], "b":"x"}}}"#.to_string(),
            },
        )
        .await
        .unwrap();

    let invocation = captures.recv().await.unwrap();
    assert!(matches!(invocation.event, ToolEvent::Invoke));
    assert_eq!(
        invocation.arguments.as_deref(),
        Some(r#"{"a": [1, 2], "b":"x"}"#)
    );
    assert_eq!(invocation.token.get(), 100);

    // Finish the execution so the harness tears down cleanly.
    harness
        .handle
        .submit_tool_message(
            ToolMessage::Response {
                text: "done".to_string(),
                is_error: false,
            },
            invocation.token,
        )
        .await
        .unwrap();
    let _reply = transport.expect_message().await;
}

#[tokio::test]
async fn unknown_tool_name_is_resource_not_found() {
    let harness = ServerHarness::new();
    let transport = harness.connected_client().await;

    harness
        .handle
        .handle_request(
            &transport.binding(),
            TransportMessage {
                msg_id: 100,
                json: tools_call_request(8, "ghost", json!({})),
            },
        )
        .await
        .unwrap();
    let reply = transport.expect_message().await.value();
    assert_eq!(reply["id"], 8);
    assert_eq!(reply["error"]["code"], -32601);
    assert_eq!(reply["error"]["message"], "Resource not found");
}

#[tokio::test]
async fn busy_tool_cannot_be_removed_until_finished() {
    let harness = ServerHarness::new();
    let (tool, mut captures) = ManualTool::new();
    harness
        .handle
        .add_tool(ToolRecord::new(metadata("slow"), tool))
        .unwrap();

    let transport = harness.connected_client().await;
    harness
        .handle
        .handle_request(
            &transport.binding(),
            TransportMessage {
                msg_id: 100,
                json: tools_call_request(1, "slow", json!({})),
            },
        )
        .await
        .unwrap();
    let invocation = captures.recv().await.unwrap();

    // In flight: removal is refused.
    assert!(matches!(
        harness.handle.remove_tool("slow"),
        Err(Error::Busy(_))
    ));

    harness
        .handle
        .submit_tool_message(
            ToolMessage::Response {
                text: "done".to_string(),
                is_error: false,
            },
            invocation.token,
        )
        .await
        .unwrap();
    let _reply = transport.expect_message().await;

    assert!(eventually(|| harness.handle.remove_tool("slow").is_ok()).await);
}

#[tokio::test]
async fn per_client_request_cap_is_enforced() {
    let harness = ServerHarness::new();
    let (tool, mut captures) = ManualTool::new();
    harness
        .handle
        .add_tool(ToolRecord::new(metadata("hold"), tool))
        .unwrap();

    let transport = harness.connected_client().await;
    let binding = transport.binding();

    // Default cap is two concurrent requests per client.
    for (msg_id, id) in [(101u32, 11i64), (102, 12)] {
        harness
            .handle
            .handle_request(
                &binding,
                TransportMessage {
                    msg_id,
                    json: tools_call_request(id, "hold", json!({})),
                },
            )
            .await
            .unwrap();
    }
    let first = captures.recv().await.unwrap();
    let second = captures.recv().await.unwrap();

    harness
        .handle
        .handle_request(
            &binding,
            TransportMessage {
                msg_id: 103,
                json: tools_call_request(13, "hold", json!({})),
            },
        )
        .await
        .unwrap();
    let reply = transport.expect_message().await.value();
    assert_eq!(reply["id"], 13);
    assert_eq!(reply["error"]["code"], -32002);
    assert_eq!(reply["error"]["message"], "Client is busy");

    // The two admitted executions are still alive and can finish.
    for invocation in [first, second] {
        harness
            .handle
            .submit_tool_message(
                ToolMessage::Response {
                    text: "done".to_string(),
                    is_error: false,
                },
                invocation.token,
            )
            .await
            .unwrap();
        let _reply = transport.expect_message().await;
    }

    // The slot drained: a new call is admitted again.
    harness
        .handle
        .handle_request(
            &binding,
            TransportMessage {
                msg_id: 104,
                json: tools_call_request(14, "hold", json!({})),
            },
        )
        .await
        .unwrap();
    let invocation = captures.recv().await.unwrap();
    harness
        .handle
        .submit_tool_message(
            ToolMessage::Response {
                text: "done".to_string(),
                is_error: false,
            },
            invocation.token,
        )
        .await
        .unwrap();
    let _reply = transport.expect_message().await;
}

#[tokio::test]
async fn failing_callback_rolls_back_and_reports() {
    let harness = ServerHarness::new();
    harness
        .handle
        .add_tool(ToolRecord::new(metadata("broken"), FailingTool::new()))
        .unwrap();

    let transport = harness.connected_client().await;
    harness
        .handle
        .handle_request(
            &transport.binding(),
            TransportMessage {
                msg_id: 100,
                json: tools_call_request(21, "broken", json!({})),
            },
        )
        .await
        .unwrap();

    let reply = transport.expect_message().await.value();
    assert_eq!(reply["id"], 21);
    assert_eq!(reply["error"]["code"], -32603);

    // Rollback released the activity counter and the client's slot.
    assert!(eventually(|| harness.handle.remove_tool("broken").is_ok()).await);
}

#[tokio::test]
async fn execution_token_dies_with_the_final_message() {
    let harness = ServerHarness::new();
    let (tool, mut captures) = ManualTool::new();
    harness
        .handle
        .add_tool(ToolRecord::new(metadata("once"), tool))
        .unwrap();

    let transport = harness.connected_client().await;
    harness
        .handle
        .handle_request(
            &transport.binding(),
            TransportMessage {
                msg_id: 100,
                json: tools_call_request(31, "once", json!({})),
            },
        )
        .await
        .unwrap();
    let invocation = captures.recv().await.unwrap();
    let token = invocation.token;

    // Pings keep the execution alive and produce no reply.
    harness
        .handle
        .submit_tool_message(ToolMessage::Ping, token)
        .await
        .unwrap();
    assert!(!harness.handle.is_execution_cancelled(token).unwrap());

    harness
        .handle
        .submit_tool_message(
            ToolMessage::Response {
                text: "done".to_string(),
                is_error: false,
            },
            token,
        )
        .await
        .unwrap();
    let _reply = transport.expect_message().await;

    // The token is invalid the moment the final message is processed.
    assert!(matches!(
        harness.handle.is_execution_cancelled(token),
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        harness
            .handle
            .submit_tool_message(ToolMessage::Ping, token)
            .await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn tool_level_errors_travel_as_is_error_results() {
    let harness = ServerHarness::new();
    harness
        .handle
        .add_tool(ToolRecord::new(
            metadata("warn"),
            ReplyTool::error(harness.handle.clone(), "sensor offline"),
        ))
        .unwrap();

    let transport = harness.connected_client().await;
    harness
        .handle
        .handle_request(
            &transport.binding(),
            TransportMessage {
                msg_id: 100,
                json: tools_call_request(41, "warn", json!({})),
            },
        )
        .await
        .unwrap();
    let reply = transport.expect_message().await.value();
    assert_eq!(reply["result"]["isError"], true);
    assert_eq!(reply["result"]["content"][0]["text"], "sensor offline");
}

#[tokio::test]
async fn request_queue_overflow_is_rejected() {
    let config = ServerConfig {
        request_workers: 1,
        ..ServerConfig::default()
    };
    let harness = ServerHarness::with_config(config);

    // Park the only worker inside a silent, cancellation-polling callback.
    harness
        .handle
        .add_tool(ToolRecord::new(
            metadata("sleep"),
            CooperativeSleeper::new(harness.handle.clone()),
        ))
        .unwrap();

    let transport = harness.connected_client().await;
    let binding = transport.binding();
    harness
        .handle
        .handle_request(
            &binding,
            TransportMessage {
                msg_id: 100,
                json: tools_call_request(51, "sleep", json!({})),
            },
        )
        .await
        .unwrap();
    // Give the worker a moment to dequeue the sleeper call.
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Queue capacity is max_clients × max_client_requests = 8. With the
    // worker parked nobody drains the queue, so the ninth enqueue fails.
    for offset in 0u32..8 {
        harness
            .handle
            .handle_request(
                &binding,
                TransportMessage {
                    msg_id: offset.saturating_add(200),
                    json: ping_request(i64::from(offset).saturating_add(60)),
                },
            )
            .await
            .unwrap();
    }
    let err = harness
        .handle
        .handle_request(
            &binding,
            TransportMessage {
                msg_id: 300,
                json: ping_request(70),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoMemory));
}
