use crate::error::Error;
use crate::gateway::Gateway;
use crate::models::{Message, MessageStatus};
use crate::response::GatewayResponse;
use crate::store::MessageStore;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn, Span};
use uuid::Uuid;

pub const TRANSPORT_ERROR_STATUS: &str = "transport-error";
pub const EMPTY_RESPONSE_STATUS: &str = "empty-response";

/// What gets written back to the store after one send attempt.
#[derive(Debug)]
struct Outcome {
    status: MessageStatus,
    gateway_status: String,
    gateway_response: String,
}

impl Outcome {
    fn from_reply(reply: Result<GatewayResponse, Error>) -> Self {
        match reply {
            Ok(response) => match response.first() {
                Some(line) => Outcome {
                    status: if response.is_error() {
                        MessageStatus::SentError
                    } else {
                        MessageStatus::SentOk
                    },
                    gateway_status: line.status_token().to_string(),
                    gateway_response: response.raw.trim().to_string(),
                },
                None => Outcome {
                    status: MessageStatus::SentError,
                    gateway_status: EMPTY_RESPONSE_STATUS.to_string(),
                    gateway_response: response.raw.clone(),
                },
            },
            Err(e) => Outcome {
                status: MessageStatus::SentError,
                gateway_status: TRANSPORT_ERROR_STATUS.to_string(),
                gateway_response: e.to_string(),
            },
        }
    }
}

pub struct DispatchEngine<G> {
    store: MessageStore,
    gateway: G,
    claim_lease: Duration,
}

impl<G: Gateway> DispatchEngine<G> {
    pub fn new(store: MessageStore, gateway: G, claim_lease: Duration) -> Self {
        Self {
            store,
            gateway,
            claim_lease,
        }
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub async fn queue(&self, destination: &str, body: &str) -> Result<i64, Error> {
        self.store.insert(destination, body).await
    }

    /// Dispatches up to `limit` queued messages, oldest first.
    ///
    /// Returns how many messages were attempted; per-message failures only
    /// show up in each message's stored status.
    pub async fn process(&self, limit: i64) -> Result<usize, Error> {
        self.process_until(limit, &CancellationToken::new()).await
    }

    /// Like [`process`](Self::process), but stops between messages once `cancel` fires.
    ///
    /// A message whose send has started is always marked before stopping.
    #[instrument(skip(self, cancel), fields(claimed = 0, attempted = 0))]
    pub async fn process_until(
        &self,
        limit: i64,
        cancel: &CancellationToken,
    ) -> Result<usize, Error> {
        let claim = self.store.claim_queued(limit, self.claim_lease).await?;

        let claimed = claim.messages.len();
        Span::current().record("claimed", claimed);
        if claimed == 0 {
            info!("No queued messages found.");
            return Ok(0);
        }
        info!(claimed, "Claimed messages to send.");

        let mut attempted = 0;
        for (index, message) in claim.messages.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(attempted, claimed, "Dispatch cancelled, releasing remaining messages.");
                self.abandon(&claim.messages[index..], claim.token).await;
                break;
            }

            match self.store.renew_claim(claim.token, message.id).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(id = message.id, "Claim expired before send, skipping message.");
                    continue;
                }
                Err(e) => {
                    self.abandon(&claim.messages[index..], claim.token).await;
                    return Err(e);
                }
            }

            match self.dispatch_one(message, claim.token).await {
                Ok(()) => {}
                Err(Error::ClaimLost(id)) => {
                    error!(id, "Message was sent after its claim expired.");
                }
                Err(e) => {
                    error!(id = message.id, "Failed to record message status: {}", e);
                    self.abandon(&claim.messages[index + 1..], claim.token).await;
                    return Err(e);
                }
            }
            attempted += 1;
        }

        Span::current().record("attempted", attempted);
        info!(attempted, "Dispatch pass complete.");
        Ok(attempted)
    }

    async fn dispatch_one(&self, message: &Message, token: Uuid) -> Result<(), Error> {
        let reply = self
            .gateway
            .send_message(&message.destination, &message.body)
            .await;
        if let Err(e) = &reply {
            warn!(id = message.id, "Gateway send failed: {}", e);
        }

        let outcome = Outcome::from_reply(reply);
        self.store
            .complete_claimed(
                token,
                message.id,
                outcome.status,
                Some(&outcome.gateway_status),
                Some(&outcome.gateway_response),
            )
            .await?;

        info!(
            id = message.id,
            status = ?outcome.status,
            gateway_status = %outcome.gateway_status,
            "Message dispatched."
        );
        Ok(())
    }

    /// Releases `rest` on a path that is already stopping; failures are only logged.
    async fn abandon(&self, rest: &[Message], token: Uuid) {
        if let Err(e) = self.release_rest(rest, token).await {
            warn!("Could not release claimed messages: {}", e);
        }
    }

    async fn release_rest(&self, rest: &[Message], token: Uuid) -> Result<(), Error> {
        let ids: Vec<i64> = rest.iter().map(|m| m.id).collect();
        self.store.release_claims(token, &ids).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::parse;
    use crate::store::memory_store;
    use async_trait::async_trait;
    use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};

    const LEASE: Duration = Duration::from_secs(300);

    /// Replies are handed out in order; an exhausted script answers `OK`.
    #[derive(Default)]
    struct ScriptedGateway {
        replies: Mutex<VecDeque<Result<String, String>>>,
        sent: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedGateway {
        fn with(replies: Vec<Result<&str, &str>>) -> Self {
            let replies = replies
                .into_iter()
                .map(|r| r.map(str::to_string).map_err(str::to_string))
                .collect();
            Self {
                replies: Mutex::new(replies),
                sent: Mutex::default(),
            }
        }

        fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Gateway for ScriptedGateway {
        async fn send_message(
            &self,
            destination: &str,
            body: &str,
        ) -> Result<GatewayResponse, Error> {
            self.sent
                .lock()
                .unwrap()
                .push((destination.to_string(), body.to_string()));
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok("OK dest:1\n".to_string()));
            reply.map(|text| parse(&text)).map_err(Error::Transport)
        }

        async fn get_credit(&self) -> Result<GatewayResponse, Error> {
            Ok(parse("OK credit(0):10\n"))
        }
    }

    /// Counts sends per body and sleeps `delay` mid-send so concurrent passes interleave.
    #[derive(Default)]
    struct CountingGateway {
        sends: Mutex<HashMap<String, usize>>,
        delay: Duration,
    }

    impl CountingGateway {
        fn sleeping(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }

        fn counts(&self) -> HashMap<String, usize> {
            self.sends.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Gateway for CountingGateway {
        async fn send_message(
            &self,
            _destination: &str,
            body: &str,
        ) -> Result<GatewayResponse, Error> {
            *self.sends.lock().unwrap().entry(body.to_string()).or_default() += 1;
            tokio::time::sleep(self.delay).await;
            Ok(parse("OK\n"))
        }

        async fn get_credit(&self) -> Result<GatewayResponse, Error> {
            Ok(parse("OK credit(0):0\n"))
        }
    }

    /// Fires the token as soon as the first message is sent.
    struct CancellingGateway {
        cancel: CancellationToken,
    }

    #[async_trait]
    impl Gateway for CancellingGateway {
        async fn send_message(
            &self,
            _destination: &str,
            _body: &str,
        ) -> Result<GatewayResponse, Error> {
            self.cancel.cancel();
            Ok(parse("OK\n"))
        }

        async fn get_credit(&self) -> Result<GatewayResponse, Error> {
            Ok(parse("OK credit(0):0\n"))
        }
    }

    /// Deletes the row of the message it is asked to send, so its status write fails.
    struct VanishingGateway {
        pool: sqlx::SqlitePool,
        vanish: String,
    }

    #[async_trait]
    impl Gateway for VanishingGateway {
        async fn send_message(
            &self,
            _destination: &str,
            body: &str,
        ) -> Result<GatewayResponse, Error> {
            if body == self.vanish {
                sqlx::query("DELETE FROM messages WHERE body = ?")
                    .bind(body)
                    .execute(&self.pool)
                    .await?;
            }
            Ok(parse("OK\n"))
        }

        async fn get_credit(&self) -> Result<GatewayResponse, Error> {
            Ok(parse("OK credit(0):0\n"))
        }
    }

    #[test]
    fn outcome_follows_first_line() {
        let ok = Outcome::from_reply(Ok(parse("OK dest:1\nERROR dest:2\n")));
        assert_eq!(ok.status, MessageStatus::SentOk);
        assert_eq!(ok.gateway_status, "OK");
        assert_eq!(ok.gateway_response, "OK dest:1\nERROR dest:2");

        let err = Outcome::from_reply(Ok(parse("ERROR errNum:020\n")));
        assert_eq!(err.status, MessageStatus::SentError);
        assert_eq!(err.gateway_status, "ERROR");

        let empty = Outcome::from_reply(Ok(parse("\n")));
        assert_eq!(empty.status, MessageStatus::SentError);
        assert_eq!(empty.gateway_status, EMPTY_RESPONSE_STATUS);

        let transport = Outcome::from_reply(Err(Error::Transport("connection refused".into())));
        assert_eq!(transport.status, MessageStatus::SentError);
        assert_eq!(transport.gateway_status, TRANSPORT_ERROR_STATUS);
        assert!(transport.gateway_response.contains("connection refused"));
    }

    #[tokio::test]
    async fn process_marks_each_message_from_its_reply() {
        let gateway =
            ScriptedGateway::with(vec![Ok("OK dest:600000001\n"), Ok("ERROR errNum:020\n")]);
        let engine = DispatchEngine::new(memory_store().await, gateway, LEASE);

        let first = engine.queue("600000001", "first").await.unwrap();
        let second = engine.queue("600000002", "second").await.unwrap();

        assert_eq!(engine.process(10).await.unwrap(), 2);

        let first = engine.store().get(first).await.unwrap();
        assert_eq!(first.status, MessageStatus::SentOk);
        assert_eq!(first.gateway_status.as_deref(), Some("OK"));
        assert_eq!(first.gateway_response.as_deref(), Some("OK dest:600000001"));

        let second = engine.store().get(second).await.unwrap();
        assert_eq!(second.status, MessageStatus::SentError);
        assert_eq!(second.gateway_status.as_deref(), Some("ERROR"));
        assert_eq!(second.gateway_response.as_deref(), Some("ERROR errNum:020"));

        assert!(engine
            .store()
            .fetch_by_status(MessageStatus::Queued, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn transport_failure_does_not_abort_the_batch() {
        let gateway = ScriptedGateway::with(vec![Err("connection reset"), Ok("OK\n")]);
        let engine = DispatchEngine::new(memory_store().await, gateway, LEASE);

        let first = engine.queue("1", "a").await.unwrap();
        let second = engine.queue("2", "b").await.unwrap();

        assert_eq!(engine.process(10).await.unwrap(), 2);

        let first = engine.store().get(first).await.unwrap();
        assert_eq!(first.status, MessageStatus::SentError);
        assert_eq!(first.gateway_status.as_deref(), Some(TRANSPORT_ERROR_STATUS));
        assert!(first.gateway_response.unwrap().contains("connection reset"));

        assert_eq!(engine.store().get(second).await.unwrap().status, MessageStatus::SentOk);
    }

    #[tokio::test]
    async fn process_takes_the_oldest_messages_in_order() {
        let gateway = ScriptedGateway::default();
        let engine = DispatchEngine::new(memory_store().await, gateway, LEASE);

        let t1 = engine.queue("1", "t1").await.unwrap();
        let t2 = engine.queue("2", "t2").await.unwrap();
        let t3 = engine.queue("3", "t3").await.unwrap();

        assert_eq!(engine.process(2).await.unwrap(), 2);

        assert_eq!(
            engine.gateway().sent(),
            vec![("1".to_string(), "t1".to_string()), ("2".to_string(), "t2".to_string())]
        );
        assert_eq!(engine.store().get(t1).await.unwrap().status, MessageStatus::SentOk);
        assert_eq!(engine.store().get(t2).await.unwrap().status, MessageStatus::SentOk);
        assert_eq!(engine.store().get(t3).await.unwrap().status, MessageStatus::Queued);

        let remaining = engine.store().fetch_by_status(MessageStatus::Queued, 5).await.unwrap();
        assert_eq!(remaining.iter().map(|m| m.id).collect::<Vec<_>>(), vec![t3]);
    }

    #[tokio::test]
    async fn terminal_messages_are_never_redispatched() {
        let gateway = ScriptedGateway::default();
        let engine = DispatchEngine::new(memory_store().await, gateway, LEASE);

        engine.queue("1", "only").await.unwrap();
        assert_eq!(engine.process(10).await.unwrap(), 1);
        assert_eq!(engine.process(10).await.unwrap(), 0);
        assert_eq!(engine.gateway().sent().len(), 1);
    }

    #[tokio::test]
    async fn queued_listing_tracks_untransitioned_messages_across_passes() {
        let gateway = ScriptedGateway::default();
        let engine = DispatchEngine::new(memory_store().await, gateway, LEASE);

        let mut ids = Vec::new();
        for n in 0..3 {
            ids.push(engine.queue("1", &format!("m{}", n)).await.unwrap());
        }
        engine.process(1).await.unwrap();
        for n in 3..5 {
            ids.push(engine.queue("1", &format!("m{}", n)).await.unwrap());
        }
        engine.process(2).await.unwrap();

        let queued = engine.store().fetch_by_status(MessageStatus::Queued, 2).await.unwrap();
        assert_eq!(queued.iter().map(|m| m.id).collect::<Vec<_>>(), ids[3..5]);
    }

    #[tokio::test]
    async fn invalid_limit_is_an_error() {
        let engine = DispatchEngine::new(memory_store().await, ScriptedGateway::default(), LEASE);
        assert!(matches!(engine.process(0).await, Err(Error::InvalidLimit(0))));
    }

    #[tokio::test]
    async fn cancellation_marks_the_in_flight_message_and_releases_the_rest() {
        let cancel = CancellationToken::new();
        let gateway = CancellingGateway {
            cancel: cancel.clone(),
        };
        let engine = DispatchEngine::new(memory_store().await, gateway, LEASE);

        let first = engine.queue("1", "a").await.unwrap();
        let second = engine.queue("2", "b").await.unwrap();

        assert_eq!(engine.process_until(10, &cancel).await.unwrap(), 1);

        assert_eq!(engine.store().get(first).await.unwrap().status, MessageStatus::SentOk);
        assert_eq!(engine.store().get(second).await.unwrap().status, MessageStatus::Queued);

        // The released message is claimable again right away.
        let claim = engine.store().claim_queued(10, LEASE).await.unwrap();
        assert_eq!(claim.messages.iter().map(|m| m.id).collect::<Vec<_>>(), vec![second]);
    }

    #[tokio::test]
    async fn status_write_failure_aborts_the_batch() {
        let store = memory_store().await;
        let gateway = VanishingGateway {
            pool: store.pool().clone(),
            vanish: "b".to_string(),
        };
        let engine = DispatchEngine::new(store, gateway, LEASE);

        let a = engine.queue("1", "a").await.unwrap();
        let b = engine.queue("2", "b").await.unwrap();
        let c = engine.queue("3", "c").await.unwrap();

        let result = engine.process(10).await;
        assert!(matches!(result, Err(Error::NotFound(id)) if id == b));

        // Progress made before the failure is kept.
        assert_eq!(engine.store().get(a).await.unwrap().status, MessageStatus::SentOk);
        assert_eq!(engine.store().get(c).await.unwrap().status, MessageStatus::Queued);

        let claim = engine.store().claim_queued(10, LEASE).await.unwrap();
        assert_eq!(claim.messages.iter().map(|m| m.id).collect::<Vec<_>>(), vec![c]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_passes_never_double_send() {
        let dir = tempfile::tempdir().unwrap();
        let options = SqliteConnectOptions::new()
            .filename(dir.path().join("messages.db"))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .unwrap();
        let store = MessageStore::new(pool);
        store.create_schema().await.unwrap();

        let gateway = Arc::new(CountingGateway::sleeping(Duration::from_millis(2)));
        let engine = Arc::new(DispatchEngine::new(store, Arc::clone(&gateway), LEASE));

        for n in 0..40 {
            engine.queue("1", &format!("m{}", n)).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                let mut total = 0;
                loop {
                    let attempted = engine.process(5).await.unwrap();
                    if attempted == 0 {
                        return total;
                    }
                    total += attempted;
                }
            }));
        }

        let mut attempted = 0;
        for handle in handles {
            attempted += handle.await.unwrap();
        }

        assert_eq!(attempted, 40);
        let sends = gateway.counts();
        assert_eq!(sends.len(), 40);
        assert!(sends.values().all(|&count| count == 1));
        assert_eq!(
            engine.store().fetch_by_status(MessageStatus::SentOk, 100).await.unwrap().len(),
            40
        );
    }

    #[tokio::test]
    async fn pass_outliving_its_lease_skips_reclaimed_messages() {
        let gateway = CountingGateway::sleeping(Duration::from_millis(300));
        let lease = Duration::from_millis(400);
        let engine = DispatchEngine::new(memory_store().await, gateway, lease);

        let mut ids = Vec::new();
        for n in 0..4 {
            ids.push(engine.queue("1", &format!("m{}", n)).await.unwrap());
        }

        // The second pass starts after the first has held m2 and m3 past the lease.
        let (slow, late) = tokio::join!(engine.process(4), async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            engine.process(4).await
        });

        assert_eq!(slow.unwrap(), 2);
        assert_eq!(late.unwrap(), 2);

        let sends = engine.gateway().counts();
        assert_eq!(sends.len(), 4);
        assert!(sends.values().all(|&count| count == 1), "{:?}", sends);
        for id in ids {
            assert_eq!(engine.store().get(id).await.unwrap().status, MessageStatus::SentOk);
        }
    }

    #[tokio::test]
    async fn send_finishing_after_claim_loss_keeps_the_newer_outcome() {
        let store = memory_store().await;
        let gateway = ScriptedGateway::with(vec![Ok("ERROR errNum:020\n")]);
        let engine = DispatchEngine::new(store.clone(), gateway, LEASE);
        let id = engine.queue("1", "a").await.unwrap();

        let stale = store.claim_queued(1, LEASE).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let fresh = store.claim_queued(1, Duration::ZERO).await.unwrap();
        store
            .complete_claimed(fresh.token, id, MessageStatus::SentOk, Some("OK"), Some("OK"))
            .await
            .unwrap();

        let late = engine.dispatch_one(&stale.messages[0], stale.token).await;
        assert!(matches!(late, Err(Error::ClaimLost(lost)) if lost == id));

        let message = store.get(id).await.unwrap();
        assert_eq!(message.status, MessageStatus::SentOk);
        assert_eq!(message.gateway_status.as_deref(), Some("OK"));
    }
}
