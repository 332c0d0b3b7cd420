//! Integration tests for the bulk mailer against the mock SMTP server.

use std::time::Duration;

use bulk_mailer::mocks::{MockConnector, MockTransport};
use bulk_mailer::{
    BulkMailer, Campaign, DelayRange, DeliveryLogStore, DeliveryStatus, LogStoreError,
    MailerConfig, MailerError, MailerState, SendOutcome, SmtpErrorKind, TlsMode,
};
use rstest::rstest;

fn config(mode: TlsMode) -> MailerConfig {
    MailerConfig::builder()
        .host("mock.example.com")
        .sender("news@example.com")
        .password("app-password")
        .tls_mode(mode)
        .build()
        .unwrap()
}

fn mailer_with(mock: &MockTransport) -> (BulkMailer, DeliveryLogStore) {
    let store = DeliveryLogStore::open_in_memory().unwrap();
    let mailer = BulkMailer::with_connector(
        config(TlsMode::StartTlsRequired),
        store.clone(),
        MockConnector::new(mock.clone()),
    )
    .with_seed(7);
    (mailer, store)
}

fn no_delay() -> DelayRange {
    DelayRange::new(0, 0).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_bulk_send_logs_every_recipient_in_order() {
    let mock = MockTransport::new();
    let (mut mailer, store) = mailer_with(&mock);

    mailer.connect().await.unwrap();
    assert_eq!(mailer.state(), MailerState::Connected);

    let report = mailer
        .send_bulk(["a@x.com", "b@x.com"], "Hi", "Body", no_delay())
        .await
        .unwrap();

    assert_eq!(report.total, 2);
    assert!(report.all_succeeded());
    assert_eq!(mock.delivered(), vec!["a@x.com", "b@x.com"]);

    let entries = store.entries().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].recipient, "a@x.com");
    assert_eq!(entries[1].recipient, "b@x.com");
    assert!(entries.iter().all(|e| e.status == DeliveryStatus::Success));
    assert!(entries.iter().all(|e| e.subject == "Hi"));
    assert!(entries[0].id < entries[1].id);

    mailer.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_rejected_recipient_does_not_stop_the_batch() {
    let mock = MockTransport::new().rejecting_recipient("b@x.com");
    let (mut mailer, store) = mailer_with(&mock);
    mailer.connect().await.unwrap();

    let report = mailer
        .send_bulk(["a@x.com", "b@x.com", "c@x.com"], "Hi", "Body", no_delay())
        .await
        .unwrap();

    assert_eq!((report.succeeded, report.failed), (2, 1));
    let failure = report.outcomes[1].outcome.error().unwrap();
    assert_eq!(failure.smtp_code(), Some(550));

    let statuses: Vec<_> = store.entries().unwrap().iter().map(|e| e.status).collect();
    assert_eq!(
        statuses,
        vec![DeliveryStatus::Success, DeliveryStatus::Failed, DeliveryStatus::Success]
    );
    assert_eq!(mock.delivered(), vec!["a@x.com", "c@x.com"]);
    assert!(mock.command_names().contains(&"RSET".to_string()));
}

#[tokio::test]
async fn test_message_payload_reaches_server() {
    let mock = MockTransport::new();
    let (mut mailer, _store) = mailer_with(&mock);
    mailer.connect().await.unwrap();
    mock.clear_commands();

    let outcome = mailer
        .send_one("a@x.com", "Monthly update", "Hello there")
        .await
        .unwrap();
    let receipt = outcome.receipt().unwrap();
    assert_eq!(receipt.recipient, "a@x.com");
    assert!(receipt.size > 0);

    assert_eq!(mock.command_names(), vec!["MAIL", "RCPT", "DATA"]);
    let commands = mock.commands();
    assert!(commands[0].starts_with("MAIL FROM:<news@example.com>"));
    assert_eq!(commands[1], "RCPT TO:<a@x.com>");

    let payload = String::from_utf8(mock.data().pop().unwrap()).unwrap();
    assert!(payload.contains("Subject: Monthly update\r\n"));
    assert!(payload.contains("Hello there"));
    assert!(payload.ends_with("\r\n.\r\n"));
}

#[rstest]
#[case(TlsMode::StartTlsRequired, vec!["EHLO", "STARTTLS", "EHLO", "AUTH"])]
#[case(TlsMode::StartTls, vec!["EHLO", "STARTTLS", "EHLO", "AUTH"])]
#[case(TlsMode::Implicit, vec!["EHLO", "AUTH"])]
#[case(TlsMode::None, vec!["EHLO", "AUTH"])]
#[tokio::test]
async fn test_handshake_per_tls_mode(#[case] mode: TlsMode, #[case] expected: Vec<&str>) {
    let mock = MockTransport::new();
    let mut mailer = BulkMailer::with_connector(
        config(mode),
        DeliveryLogStore::open_in_memory().unwrap(),
        MockConnector::new(mock.clone()),
    );

    mailer.connect().await.unwrap();
    assert_eq!(mock.command_names(), expected);
}

#[tokio::test]
async fn test_rejected_credentials_leave_mailer_unconnected() {
    let mock = MockTransport::new().rejecting_auth();
    let (mut mailer, store) = mailer_with(&mock);

    let err = mailer.connect().await.unwrap_err();
    let smtp = err.smtp_error().unwrap();
    assert_eq!(smtp.kind(), SmtpErrorKind::CredentialsInvalid);
    assert_eq!(mailer.state(), MailerState::Unconnected);
    assert!(mock.is_closed());

    let snapshot = mailer.metrics();
    assert_eq!(snapshot.connection_attempts, 1);
    assert_eq!(snapshot.connections_failed, 1);
    assert_eq!(store.count().unwrap(), 0);
}

#[tokio::test]
async fn test_unreachable_server_is_a_connection_error() {
    let mut mailer = BulkMailer::with_connector(
        config(TlsMode::StartTlsRequired),
        DeliveryLogStore::open_in_memory().unwrap(),
        MockConnector::failing(SmtpErrorKind::ConnectionRefused, "Connection refused"),
    );

    let err = mailer.connect().await.unwrap_err();
    assert!(matches!(err, MailerError::Connection(_)));
    assert_eq!(mailer.state(), MailerState::Unconnected);
}

#[tokio::test]
async fn test_required_starttls_missing() {
    let mock = MockTransport::new().without_starttls();
    let (mut mailer, _store) = mailer_with(&mock);

    let err = mailer.connect().await.unwrap_err();
    assert_eq!(
        err.smtp_error().map(|e| e.kind()),
        Some(SmtpErrorKind::StarttlsNotSupported)
    );
    assert!(!mock.command_names().contains(&"AUTH".to_string()));
}

#[tokio::test]
async fn test_connect_twice_is_a_no_op() {
    let mock = MockTransport::new();
    let connector = MockConnector::new(mock.clone());
    let mut mailer = BulkMailer::with_connector(
        config(TlsMode::StartTlsRequired),
        DeliveryLogStore::open_in_memory().unwrap(),
        connector.clone(),
    );

    mailer.connect().await.unwrap();
    mailer.connect().await.unwrap();
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test]
async fn test_reconnect_after_failed_attempt() {
    let mock = MockTransport::new();
    let connector = MockConnector::new(mock.clone());
    let mut mailer = BulkMailer::with_connector(
        config(TlsMode::StartTlsRequired),
        DeliveryLogStore::open_in_memory().unwrap(),
        connector.clone(),
    );

    mock.queue_error(421, "4.3.2 Service shutting down");
    assert!(mailer.connect().await.is_err());
    assert_eq!(mailer.state(), MailerState::Unconnected);

    mailer.connect().await.unwrap();
    assert_eq!(mailer.state(), MailerState::Connected);
    assert_eq!(connector.attempts(), 2);
}

#[tokio::test]
async fn test_send_without_connect_is_logged_as_failed() {
    let mock = MockTransport::new();
    let (mut mailer, store) = mailer_with(&mock);

    let outcome = mailer.send_one("a@x.com", "Hi", "Body").await.unwrap();
    assert!(matches!(&outcome, SendOutcome::Failed(e) if e.kind() == SmtpErrorKind::NotConnected));

    let entries = store.entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, DeliveryStatus::Failed);
    assert!(mock.commands().is_empty());
}

#[tokio::test]
async fn test_invalid_recipient_is_logged_verbatim() {
    let mock = MockTransport::new();
    let (mut mailer, store) = mailer_with(&mock);
    mailer.connect().await.unwrap();
    mock.clear_commands();

    let outcome = mailer.send_one("<evil>\r\nRCPT", "Hi", "Body").await.unwrap();
    assert!(!outcome.is_success());
    assert!(mock.commands().is_empty());

    let entries = store.entries().unwrap();
    assert_eq!(entries[0].recipient, "<evil>\r\nRCPT");
    assert_eq!(entries[0].status, DeliveryStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_mid_batch_fails_remaining_sends() {
    let mock = MockTransport::new();
    let (mut mailer, store) = mailer_with(&mock);
    mailer.connect().await.unwrap();

    assert!(mailer.send_one("a@x.com", "Hi", "Body").await.unwrap().is_success());
    mock.disconnect();

    let report = mailer
        .send_bulk(["b@x.com", "c@x.com"], "Hi", "Body", no_delay())
        .await
        .unwrap();
    assert_eq!(report.failed, 2);
    assert!(report
        .outcomes
        .iter()
        .all(|o| o.outcome.error().map(|e| e.is_connection_failure()) == Some(true)));
    assert_eq!(store.count_by_status(DeliveryStatus::Failed).unwrap(), 2);

    // Closing a dead session still closes the mailer.
    mailer.close().await;
    assert_eq!(mailer.state(), MailerState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_pause_follows_every_send() {
    let mock = MockTransport::new();
    let (mut mailer, _store) = mailer_with(&mock);
    mailer.connect().await.unwrap();

    let report = mailer
        .send_bulk(
            ["a@x.com", "b@x.com", "c@x.com"],
            "Hi",
            "Body",
            DelayRange::new(2, 2).unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(mailer.metrics().total_delay, Duration::from_secs(6));
    assert!(report.duration >= Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn test_sampled_pauses_stay_in_range() {
    let mock = MockTransport::new();
    let (mut mailer, _store) = mailer_with(&mock);
    mailer.connect().await.unwrap();

    let recipients: Vec<String> = (0..10).map(|i| format!("user{}@x.com", i)).collect();
    mailer
        .send_bulk(&recipients, "Hi", "Body", DelayRange::new(1, 5).unwrap())
        .await
        .unwrap();

    let total = mailer.metrics().total_delay;
    assert!(total >= Duration::from_secs(10));
    assert!(total <= Duration::from_secs(50));
}

#[tokio::test]
async fn test_inverted_delay_is_rejected_before_sending() {
    let mock = MockTransport::new();
    let (mut mailer, store) = mailer_with(&mock);
    mailer.connect().await.unwrap();

    let err = mailer
        .send_bulk(["a@x.com"], "Hi", "Body", DelayRange { min: 5, max: 1 })
        .await
        .unwrap_err();
    assert!(matches!(err, MailerError::Configuration(_)));
    assert_eq!(store.count().unwrap(), 0);
}

#[tokio::test]
async fn test_empty_recipient_list() {
    let mock = MockTransport::new();
    let (mut mailer, store) = mailer_with(&mock);
    mailer.connect().await.unwrap();

    let report = mailer
        .send_bulk(Vec::<String>::new(), "Hi", "Body", no_delay())
        .await
        .unwrap();
    assert_eq!(report.total, 0);
    assert_eq!(store.count().unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_send_campaign_uses_its_delay() {
    let mock = MockTransport::new();
    let (mut mailer, store) = mailer_with(&mock);
    mailer.connect().await.unwrap();

    let campaign: Campaign = r#"{
        "subject": "Launch",
        "body": "We are live.",
        "recipients": ["a@x.com", "b@x.com"],
        "delay": {"min": 3, "max": 3}
    }"#
    .parse()
    .unwrap();

    let report = mailer.send_campaign(&campaign).await.unwrap();
    assert_eq!(report.succeeded, 2);
    assert_eq!(mailer.metrics().total_delay, Duration::from_secs(6));
    assert!(store.entries().unwrap().iter().all(|e| e.subject == "Launch"));
}

#[tokio::test]
async fn test_close_is_idempotent_and_terminal() {
    let mock = MockTransport::new();
    let (mut mailer, store) = mailer_with(&mock);
    mailer.connect().await.unwrap();

    mailer.close().await;
    mailer.close().await;
    assert_eq!(mailer.state(), MailerState::Closed);
    assert!(mock.is_closed());
    assert_eq!(
        mock.command_names().iter().filter(|c| *c == "QUIT").count(),
        1
    );
    assert!(!store.is_open());

    let err = mailer.connect().await.unwrap_err();
    assert!(matches!(err, MailerError::InvalidState(_)));

    let err = mailer.send_one("a@x.com", "Hi", "Body").await.unwrap_err();
    assert!(matches!(err, MailerError::Store(LogStoreError::Closed)));
}

#[tokio::test]
async fn test_close_without_connect() {
    let mock = MockTransport::new();
    let (mut mailer, _store) = mailer_with(&mock);

    mailer.close().await;
    assert_eq!(mailer.state(), MailerState::Closed);
    assert!(mock.commands().is_empty());
}
