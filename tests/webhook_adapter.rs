//! HTTP adapters against a local mock server.

use serde_json::json;
use std::collections::HashMap;
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use zeroclaw_relay::adapters::webhook::{
    verify_signature, SIGNATURE_HEADER, SIGNATURE_TOLERANCE_SECS, TIMESTAMP_HEADER,
};
use zeroclaw_relay::config::{TelegramAdapterConfig, WebhookAdapterConfig};
use zeroclaw_relay::dead_letter::DeadLetterFilter;
use zeroclaw_relay::{Config, PublishOptions, Relay};

fn webhook(url: String, secret: Option<&str>) -> WebhookAdapterConfig {
    WebhookAdapterConfig {
        id: "ops".into(),
        url,
        subject_prefixes: vec!["relay.webhook.ops".into()],
        secret: secret.map(str::to_string),
        headers: HashMap::from([("X-Team".to_string(), "platform".to_string())]),
    }
}

async fn open_with(tmp: &TempDir, configure: impl FnOnce(&mut Config)) -> Relay {
    let mut config = Config::default();
    config.data_dir = tmp.path().join("data");
    config.adapters.delivery_timeout_secs = 5;
    configure(&mut config);
    Relay::open(&config).await.unwrap()
}

#[tokio::test]
async fn webhook_delivery_is_signed_and_verifiable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header_exists(SIGNATURE_HEADER))
        .and(header("X-Team", "platform"))
        .and(body_partial_json(json!({"subject": "relay.webhook.ops.deploy"})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let tmp = TempDir::new().unwrap();
    let url = format!("{}/hook", server.uri());
    let relay = open_with(&tmp, |config| {
        config.adapters.webhooks.push(webhook(url, Some("s3cret")));
    })
    .await;

    let result = relay
        .publish(
            "relay.webhook.ops.deploy",
            json!({"version": "1.4.2"}),
            PublishOptions::new("relay.system.ci"),
        )
        .await
        .unwrap();
    assert_eq!(result.delivered_to, 1);
    assert!(!result.dead_lettered);
    let adapter = result.adapter_result.unwrap();
    assert_eq!(adapter.adapter_id, "ops");
    assert!(adapter.success, "{:?}", adapter.error);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    let body = String::from_utf8(request.body.clone()).unwrap();
    let timestamp = request.headers.get(TIMESTAMP_HEADER).unwrap().to_str().unwrap();
    let signature = request.headers.get(SIGNATURE_HEADER).unwrap().to_str().unwrap();
    assert!(verify_signature(
        "s3cret",
        &body,
        timestamp,
        signature,
        SIGNATURE_TOLERANCE_SECS
    ));
    assert!(!verify_signature(
        "wrong",
        &body,
        timestamp,
        signature,
        SIGNATURE_TOLERANCE_SECS
    ));

    let payload: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(payload["envelope"]["id"], json!(result.message_id));
    assert_eq!(payload["envelope"]["payload"]["version"], json!("1.4.2"));
}

#[tokio::test]
async fn webhook_error_status_dead_letters_with_adapter_reason() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .mount(&server)
        .await;

    let tmp = TempDir::new().unwrap();
    let url = format!("{}/hook", server.uri());
    let relay = open_with(&tmp, |config| {
        config.adapters.webhooks.push(webhook(url, None));
    })
    .await;

    let result = relay
        .publish(
            "relay.webhook.ops.alert",
            json!("disk at 95%"),
            PublishOptions::new("relay.system.monitor"),
        )
        .await
        .unwrap();
    assert_eq!(result.delivered_to, 0);
    assert!(result.dead_lettered);
    let error = result.adapter_result.unwrap().error.unwrap();
    assert!(error.contains("500"), "{error}");

    let entry = relay
        .list_dead_letters(&DeadLetterFilter::default())
        .unwrap()
        .remove(0);
    assert!(entry.reason.starts_with("adapter ops failed:"), "{}", entry.reason);
    assert!(entry.reason.contains("upstream exploded"));

    let status = &relay.adapter_statuses()[0];
    assert_eq!(status.failed, 1);
    assert!(status.last_error.is_some());
}

#[tokio::test]
async fn unsigned_webhook_omits_signature_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let tmp = TempDir::new().unwrap();
    let url = format!("{}/hook", server.uri());
    let relay = open_with(&tmp, |config| {
        config.adapters.webhooks.push(webhook(url, None));
    })
    .await;

    relay
        .publish(
            "relay.webhook.ops",
            json!(1),
            PublishOptions::new("relay.system.ci"),
        )
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    assert!(requests[0].headers.get(SIGNATURE_HEADER).is_none());
    assert!(requests[0].headers.get(TIMESTAMP_HEADER).is_some());
}

#[tokio::test]
async fn telegram_adapter_sends_to_chat_from_subject() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bot123:ABC/sendMessage"))
        .and(body_partial_json(json!({"chat_id": "42", "text": "build is green"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let tmp = TempDir::new().unwrap();
    let api_base = server.uri();
    let relay = open_with(&tmp, |config| {
        config.adapters.telegram = Some(TelegramAdapterConfig {
            bot_token: "123:ABC".into(),
            subject_prefix: "relay.human.telegram".into(),
            api_base,
        });
    })
    .await;

    let result = relay
        .publish(
            "relay.human.telegram.42",
            json!({"text": "build is green"}),
            PublishOptions::new("relay.system.ci"),
        )
        .await
        .unwrap();
    assert_eq!(result.delivered_to, 1);
    assert_eq!(result.adapter_result.unwrap().adapter_id, "telegram");
}
