use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{BackoffConfig, Config};
use crate::error::TransportError;
use crate::log_relay::LOG_MARKER;
use crate::message::{
    DegradeReason, DeliveryOutcome, Disposition, MediaDescriptor, MessageIdentity, RawMessage,
    SkipReason,
};
use crate::platform::Transport;
use crate::policy::{
    AdaptiveDelayController, Availability, BackoffPolicy, DedupCache, ErrorClass,
    ErrorClassifier, RateGate, TimeWindowGate,
};
use crate::sanitize;
use crate::status::StatusSnapshot;

/// Source of wall-clock time for the time-of-day gates
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Extra wait before the media cascade, as a share of the pre-send delay
const MEDIA_DELAY_FACTOR: f64 = 0.3;

/// All mutable policy state. Guarded by one lock so admission and outcome
/// recording are atomic with respect to other messages.
struct GateState {
    rate: RateGate,
    delay: AdaptiveDelayController,
    backoff: BackoffPolicy,
    dedup: DedupCache,
    availability: Availability,
}

impl GateState {
    fn record_delivery(&mut self) {
        self.rate.record_send();
        self.delay.on_success();
        self.backoff.record_success();
    }
}

/// What to do after a failed text delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reaction {
    Pause(DateTime<Utc>),
    Sleep(Duration),
}

/// How far the text cascade got across destinations
enum Delivery {
    Sent(Option<DegradeReason>),
    /// Stop requested after `delivered` destinations received the text
    Stopped { delivered: usize },
    Failed {
        error: TransportError,
        delivered: usize,
    },
}

/// Decides admission, pacing and delivery for every observed message.
pub struct ForwardPipeline {
    transport: Arc<dyn Transport>,
    destinations: Vec<String>,
    schedule: TimeWindowGate,
    classifier: ErrorClassifier,
    backoff: BackoffConfig,
    state: Mutex<GateState>,
    /// Held from admission until the outcome (and any cooldown) is recorded
    send_slot: Mutex<()>,
    cancel: CancellationToken,
    clock: Clock,
    started: Instant,
}

impl ForwardPipeline {
    pub fn new(config: &Config, transport: Arc<dyn Transport>, cancel: CancellationToken) -> Self {
        let state = GateState {
            rate: RateGate::new(&config.rate),
            delay: AdaptiveDelayController::new(config.delay.clone()),
            backoff: BackoffPolicy::new(&config.backoff),
            dedup: DedupCache::new(config.dedup.capacity),
            availability: Availability::Active,
        };
        Self {
            transport,
            destinations: config.telegram.destinations.clone(),
            schedule: TimeWindowGate::new(config.schedule.clone()),
            classifier: ErrorClassifier::new(&config.backoff),
            backoff: config.backoff.clone(),
            state: Mutex::new(state),
            send_slot: Mutex::new(()),
            cancel,
            clock: Arc::new(Utc::now),
            started: Instant::now(),
        }
    }

    /// Replace the wall clock (tests pin it to a known hour)
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn max_wait(&self) -> Duration {
        Duration::from_secs(self.backoff.max_wait_secs)
    }

    /// Listen on `sources` and process every message until cancelled or the
    /// stream ends. Each message gets its own task; they queue on the send
    /// slot, so a duplicate is still recognised while an earlier copy waits.
    pub async fn run(self: Arc<Self>, sources: &[String]) -> Result<()> {
        let mut stream = self
            .transport
            .listen(sources)
            .await
            .context("Failed to start listening on source channels")?;

        info!("Listening on {} source channel(s)", sources.len());
        let mut inflight = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Stop requested; no further messages will be admitted");
                    break;
                }
                next = stream.next() => {
                    let Some(message) = next else {
                        warn!("Source stream ended");
                        break;
                    };
                    let pipeline = Arc::clone(&self);
                    inflight.spawn(async move {
                        pipeline.process(message).await;
                    });
                }
                Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                    if let Err(e) = joined {
                        error!("Message task failed: {}", e);
                    }
                }
            }
        }

        while let Some(joined) = inflight.join_next().await {
            if let Err(e) = joined {
                error!("Message task failed during shutdown: {}", e);
            }
        }
        Ok(())
    }

    /// Run one message through the gates and the delivery cascade.
    ///
    /// Only one message at a time holds the send slot, from the gate checks
    /// until its outcome is recorded. A rate ceiling reached or a cooldown
    /// imposed by one message therefore binds every message behind it.
    pub async fn process(&self, message: RawMessage) -> Disposition {
        if self.cancel.is_cancelled() {
            return Disposition::Skipped(SkipReason::ShuttingDown);
        }
        if message
            .text
            .as_deref()
            .is_some_and(|t| t.contains(LOG_MARKER))
        {
            debug!(channel = %message.channel, "Skipping relayed log message");
            return Disposition::Skipped(SkipReason::RelayedLog);
        }

        let identity = message.identity();
        if !self.state.lock().await.dedup.should_process(&identity) {
            info!(%identity, "Skipping duplicate message");
            return Disposition::Skipped(SkipReason::Duplicate);
        }

        let _slot = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.state.lock().await.dedup.release(&identity);
                return Disposition::Skipped(SkipReason::ShuttingDown);
            }
            slot = self.send_slot.lock() => slot,
        };

        let now = self.now();
        let delay = {
            let mut state = self.state.lock().await;
            if let Some(reason) = self.admission_block(&mut state, now) {
                info!(%identity, ?reason, "Message not admitted");
                return Disposition::Skipped(reason);
            }
            state.delay.next_delay().min(self.max_wait())
        };

        info!(%identity, "All checks passed, processing message");

        let body = sanitize::clean_text(message.text.as_deref().unwrap_or_default());
        let timestamp = self
            .schedule
            .format_local(message.date, "%Y-%m-%d %H:%M:%S");
        let plain = sanitize::compose(&message.channel, &timestamp, &body);
        let html = sanitize::to_html(&plain);

        info!(%identity, delay_secs = delay.as_secs_f64(), "Waiting before send");
        if !self.wait(delay).await {
            self.state.lock().await.dedup.release(&identity);
            return Disposition::Skipped(SkipReason::ShuttingDown);
        }

        match self.deliver_all(&message, &html, &plain, delay).await {
            Delivery::Sent(degraded) => {
                let mut state = self.state.lock().await;
                state.record_delivery();
                let usage = state.rate.usage();
                info!(
                    %identity,
                    minute = usage.minute.count,
                    hour = usage.hour.count,
                    day = usage.day.count,
                    "Message relayed"
                );
                Disposition::Attempted(match degraded {
                    Some(reason) => DeliveryOutcome::DeliveredDegraded(reason),
                    None => DeliveryOutcome::Delivered,
                })
            }
            Delivery::Stopped { delivered: 0 } => {
                self.state.lock().await.dedup.release(&identity);
                Disposition::Skipped(SkipReason::ShuttingDown)
            }
            Delivery::Stopped { delivered } => {
                warn!(%identity, delivered, "Stop requested; remaining destinations skipped");
                self.state.lock().await.record_delivery();
                Disposition::Attempted(DeliveryOutcome::DeliveredDegraded(
                    DegradeReason::PartialDestinations,
                ))
            }
            Delivery::Failed { error, delivered } => {
                self.handle_failure(&identity, error, delivered).await
            }
        }
    }

    fn admission_block(&self, state: &mut GateState, now: DateTime<Utc>) -> Option<SkipReason> {
        if state.availability.is_paused() {
            return Some(SkipReason::Paused);
        }
        if !self.schedule.is_admissible(now) {
            return Some(SkipReason::OutsideWorkWindow);
        }
        if !self.schedule.is_safe_hour(now) {
            return Some(SkipReason::UnsafeHour);
        }
        if !state.rate.admit() {
            return Some(SkipReason::RateLimited);
        }
        None
    }

    /// Text cascade for every destination, then the media cascade.
    /// Only a text failure is an error; media failures degrade.
    async fn deliver_all(
        &self,
        message: &RawMessage,
        html: &str,
        plain: &str,
        delay: Duration,
    ) -> Delivery {
        let mut degraded = None;

        for (delivered, destination) in self.destinations.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Delivery::Stopped { delivered };
            }
            match self.send_text(destination, html, plain).await {
                Ok(reason) => degraded = DegradeReason::worst(degraded, reason),
                Err(error) => return Delivery::Failed { error, delivered },
            }
        }

        let Some(media) = &message.media else {
            return Delivery::Sent(degraded);
        };

        let dropped = DegradeReason::worst(degraded, Some(DegradeReason::MediaDropped));
        let media_delay = delay.mul_f64(MEDIA_DELAY_FACTOR);
        if !self.wait(media_delay).await {
            warn!("Stop requested before media relay; text portion already delivered");
            return Delivery::Sent(dropped);
        }

        for destination in &self.destinations {
            if self.cancel.is_cancelled() {
                return Delivery::Sent(dropped);
            }
            let media_result = self.send_media(destination, message, media, plain).await;
            degraded = DegradeReason::worst(degraded, media_result);
        }
        Delivery::Sent(degraded)
    }

    async fn send_text(
        &self,
        destination: &str,
        html: &str,
        plain: &str,
    ) -> std::result::Result<Option<DegradeReason>, TransportError> {
        match self.transport.deliver(destination, html, true, None).await {
            Ok(_) => {
                info!(destination, "Sent message");
                Ok(None)
            }
            Err(e) if self.classifier.classify(&e) == ErrorClass::ContentFormat => {
                warn!(destination, "Formatted send rejected ({}), retrying as plain text", e);
                self.transport.deliver(destination, plain, false, None).await?;
                info!(destination, "Sent message as plain text");
                Ok(Some(DegradeReason::PlainText))
            }
            Err(e) => {
                error!(destination, "Failed to send message: {}", e);
                Err(e)
            }
        }
    }

    async fn send_media(
        &self,
        destination: &str,
        message: &RawMessage,
        media: &MediaDescriptor,
        text: &str,
    ) -> Option<DegradeReason> {
        let description = media.describe();
        info!(destination, media = %description, "Relaying media");

        match self.transport.forward_native(destination, message).await {
            Ok(_) => {
                info!(destination, "Forwarded original media message");
                return None;
            }
            Err(e) => warn!(destination, "Direct forward failed ({}), re-uploading", e),
        }

        if self.cancel.is_cancelled() {
            return Some(DegradeReason::MediaDropped);
        }
        let caption = sanitize::take_chars(text, sanitize::MAX_CAPTION_CHARS);
        match self
            .transport
            .deliver(destination, &caption, false, Some(media))
            .await
        {
            Ok(_) => {
                info!(destination, "Re-uploaded media with caption");
                return Some(DegradeReason::MediaReuploaded);
            }
            Err(e) => error!(destination, "Media re-upload failed: {}", e),
        }

        if self.cancel.is_cancelled() {
            return Some(DegradeReason::MediaDropped);
        }
        let note = sanitize::media_note(text, &description);
        match self.transport.deliver(destination, &note, false, None).await {
            Ok(_) => {
                info!(destination, "Sent text note in place of media");
                Some(DegradeReason::MediaNoteOnly)
            }
            Err(e) => {
                error!(destination, "Media relay failed at every stage: {}", e);
                Some(DegradeReason::MediaDropped)
            }
        }
    }

    /// Record a text-stage failure and react to it. When some destinations
    /// already received the text, the send is counted and the identity kept,
    /// so a later copy of the message cannot reach them twice.
    async fn handle_failure(
        &self,
        identity: &MessageIdentity,
        err: TransportError,
        delivered: usize,
    ) -> Disposition {
        let class = self.classifier.classify(&err);
        let now = self.now();

        let (reaction, consecutive) = {
            let mut state = self.state.lock().await;
            if delivered == 0 {
                state.dedup.release(identity);
            } else {
                state.rate.record_send();
            }
            state.delay.on_error();
            // fatal errors pause outright and do not feed the backoff counter
            let cooldown = match class {
                ErrorClass::Fatal => Duration::ZERO,
                _ => state.backoff.record_error(),
            };
            let reaction = self.reaction(class, cooldown, now);
            if let Reaction::Pause(until) = reaction {
                state.availability = Availability::Paused { until };
            }
            (reaction, state.backoff.consecutive_errors())
        };

        error!(
            %identity,
            class = %class,
            consecutive_errors = consecutive,
            delivered,
            advice = class.advice(),
            "Delivery failed: {}",
            err
        );

        match reaction {
            Reaction::Pause(until) => {
                warn!(
                    "Pausing until {}",
                    self.schedule.format_local(until, "%Y-%m-%d %H:%M:%S")
                );
                Disposition::Attempted(DeliveryOutcome::Rejected(class))
            }
            Reaction::Sleep(cooldown) => {
                let cooldown = cooldown.min(self.max_wait());
                warn!(cooldown_secs = cooldown.as_secs(), "Cooling down after error");
                if !self.wait(cooldown).await {
                    info!("Stop requested during cooldown");
                }
                Disposition::Attempted(DeliveryOutcome::Deferred(cooldown))
            }
        }
    }

    fn reaction(&self, class: ErrorClass, cooldown: Duration, now: DateTime<Utc>) -> Reaction {
        let pause = || Reaction::Pause(self.schedule.next_work_start(now));
        let flood_threshold = Duration::from_secs(self.backoff.flood_pause_threshold_secs);
        let dangerous_threshold = Duration::from_secs(self.backoff.dangerous_pause_threshold_secs);
        let transient_cap = Duration::from_secs(self.backoff.transient_sleep_cap_secs);

        match class {
            ErrorClass::Fatal => pause(),
            ErrorClass::RateLimited(wait) if wait > flood_threshold => pause(),
            ErrorClass::RateLimited(wait) => Reaction::Sleep(wait),
            ErrorClass::Dangerous if cooldown > dangerous_threshold => pause(),
            ErrorClass::Dangerous => Reaction::Sleep(cooldown),
            ErrorClass::ContentFormat | ErrorClass::Transient => {
                Reaction::Sleep(cooldown.min(transient_cap))
            }
        }
    }

    /// Sleep unless the stop signal fires first; false when cancelled
    async fn wait(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Leave the paused state once the deadline passed within work hours
    pub async fn try_resume(&self) -> bool {
        let now = self.now();
        let mut state = self.state.lock().await;
        if !state
            .availability
            .may_resume(now, self.schedule.is_work_hour(now))
        {
            return false;
        }
        state.availability = Availability::Active;
        info!("Resumed message relay");
        true
    }

    pub async fn availability(&self) -> Availability {
        self.state.lock().await.availability
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        let now = self.now();
        let mut state = self.state.lock().await;
        StatusSnapshot {
            taken_at: self.schedule.format_local(now, "%Y-%m-%d %H:%M:%S"),
            uptime: self.started.elapsed(),
            rate: state.rate.usage(),
            delay_multiplier: state.delay.multiplier(),
            consecutive_errors: state.backoff.consecutive_errors(),
            paused: state.availability.is_paused(),
            pause_until: state
                .availability
                .pause_until()
                .map(|t| self.schedule.format_local(t, "%Y-%m-%d %H:%M:%S")),
            dedup_size: state.dedup.len(),
            work_hour: self.schedule.is_work_hour(now),
            safe_hour: self.schedule.is_safe_hour(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use futures::stream::BoxStream;

    use crate::error::TransportResult;
    use crate::message::DeliveryReceipt;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Deliver {
            destination: String,
            text: String,
            formatting: bool,
            media: bool,
        },
        Forward {
            destination: String,
            message_id: i64,
        },
    }

    /// Records calls and replays scripted failures; unscripted calls succeed
    #[derive(Default)]
    struct ScriptedTransport {
        calls: StdMutex<Vec<Call>>,
        deliver_failures: StdMutex<VecDeque<Option<TransportError>>>,
        forward_failures: StdMutex<VecDeque<Option<TransportError>>>,
        incoming: StdMutex<Vec<RawMessage>>,
        /// When each call was made, in call order
        stamps: StdMutex<Vec<Instant>>,
        /// Fire the token once this many calls have been made
        cancel_after: StdMutex<Option<(usize, CancellationToken)>>,
    }

    impl ScriptedTransport {
        fn fail_deliveries(&self, script: Vec<Option<TransportError>>) {
            self.deliver_failures.lock().unwrap().extend(script);
        }

        fn fail_forwards(&self, script: Vec<Option<TransportError>>) {
            self.forward_failures.lock().unwrap().extend(script);
        }

        fn cancel_after(&self, calls: usize, token: CancellationToken) {
            *self.cancel_after.lock().unwrap() = Some((calls, token));
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn stamps(&self) -> Vec<Instant> {
            self.stamps.lock().unwrap().clone()
        }

        fn record(&self, call: Call) {
            let count = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(call);
                calls.len()
            };
            self.stamps.lock().unwrap().push(Instant::now());
            if let Some((after, token)) = self.cancel_after.lock().unwrap().as_ref() {
                if count >= *after {
                    token.cancel();
                }
            }
        }

        fn deliveries_to(&self, target: &str) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, Call::Deliver { destination, .. } if destination == target))
                .count()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn listen(
            &self,
            _sources: &[String],
        ) -> TransportResult<BoxStream<'static, RawMessage>> {
            let messages = std::mem::take(&mut *self.incoming.lock().unwrap());
            Ok(futures::stream::iter(messages).boxed())
        }

        async fn deliver(
            &self,
            destination: &str,
            text: &str,
            formatting: bool,
            media: Option<&MediaDescriptor>,
        ) -> TransportResult<DeliveryReceipt> {
            self.record(Call::Deliver {
                destination: destination.to_string(),
                text: text.to_string(),
                formatting,
                media: media.is_some(),
            });
            match self.deliver_failures.lock().unwrap().pop_front().flatten() {
                Some(e) => Err(e),
                None => Ok(DeliveryReceipt { message_id: 1 }),
            }
        }

        async fn forward_native(
            &self,
            destination: &str,
            message: &RawMessage,
        ) -> TransportResult<DeliveryReceipt> {
            self.record(Call::Forward {
                destination: destination.to_string(),
                message_id: message.id,
            });
            match self.forward_failures.lock().unwrap().pop_front().flatten() {
                Some(e) => Err(e),
                None => Ok(DeliveryReceipt { message_id: 2 }),
            }
        }
    }

    fn shanghai(d: u32, h: u32) -> DateTime<Utc> {
        chrono_tz::Asia::Shanghai
            .with_ymd_and_hms(2026, 10, d, h, 0, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc)
    }

    fn test_config() -> Config {
        Config::parse(
            r#"
            [telegram]
            bot_token = "t"
            sources = ["@chanA"]
            destinations = ["@target"]

            [delay]
            min_secs = 1.0
            max_secs = 2.0
            "#,
        )
        .unwrap()
    }

    struct Harness {
        pipeline: Arc<ForwardPipeline>,
        transport: Arc<ScriptedTransport>,
        clock: Arc<StdMutex<DateTime<Utc>>>,
        cancel: CancellationToken,
    }

    fn harness_with(config: Config) -> Harness {
        let transport = Arc::new(ScriptedTransport::default());
        // Monday 2026-10-19, 10:00 local: inside work and safe hours
        let clock = Arc::new(StdMutex::new(shanghai(19, 10)));
        let clock_ref = Arc::clone(&clock);
        let cancel = CancellationToken::new();
        let pipeline = ForwardPipeline::new(&config, transport.clone(), cancel.clone())
            .with_clock(Arc::new(move || *clock_ref.lock().unwrap()));
        Harness {
            pipeline: Arc::new(pipeline),
            transport,
            clock,
            cancel,
        }
    }

    fn harness() -> Harness {
        harness_with(test_config())
    }

    fn message(id: i64, text: &str) -> RawMessage {
        RawMessage {
            id,
            chat_id: -100,
            channel: "@chanA".to_string(),
            text: Some(text.to_string()),
            media: None,
            date: shanghai(19, 9),
        }
    }

    fn photo_message(id: i64) -> RawMessage {
        RawMessage {
            media: Some(MediaDescriptor::Photo {
                file_id: "photo-file".to_string(),
            }),
            ..message(id, "new role open")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sanitized_text_is_delivered() {
        let h = harness();
        let outcome = h
            .pipeline
            .process(message(1, "   hello   world  http://x.test/y  "))
            .await;
        assert_eq!(outcome, Disposition::Attempted(DeliveryOutcome::Delivered));

        let calls = h.transport.calls();
        assert_eq!(calls.len(), 1);
        let Call::Deliver {
            destination,
            text,
            formatting,
            media,
        } = &calls[0]
        else {
            panic!("expected a deliver call");
        };
        assert_eq!(destination, "@target");
        assert!(*formatting);
        assert!(!*media);
        assert!(text.starts_with("🔄 Forwarded from: @chanA\n⏰ Time: 2026-10-19 09:00:00"));
        assert!(text.ends_with("\n\nhello world"));
        assert!(!text.contains("http"));

        let snap = h.pipeline.snapshot().await;
        assert_eq!(snap.rate.minute.count, 1);
        assert_eq!(snap.consecutive_errors, 0);
        assert!((snap.delay_multiplier - 0.9).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_identity_forwarded_once() {
        let h = harness();
        let first = h.pipeline.process(message(42, "first copy")).await;
        let before = h.pipeline.snapshot().await;
        let second = h.pipeline.process(message(42, "second copy")).await;
        let after = h.pipeline.snapshot().await;

        assert_eq!(first, Disposition::Attempted(DeliveryOutcome::Delivered));
        assert_eq!(second, Disposition::Skipped(SkipReason::Duplicate));
        assert_eq!(h.transport.calls().len(), 1);
        assert_eq!(before.rate.minute.count, after.rate.minute.count);
        assert_eq!(before.delay_multiplier, after.delay_multiplier);
        assert_eq!(before.dedup_size, after.dedup_size);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_flood_wait_pauses_until_next_work_start() {
        let h = harness();
        h.transport
            .fail_deliveries(vec![Some(TransportError::flood_wait(600))]);

        let outcome = h.pipeline.process(message(5, "job post")).await;
        assert_eq!(
            outcome,
            Disposition::Attempted(DeliveryOutcome::Rejected(ErrorClass::RateLimited(
                Duration::from_secs(600)
            )))
        );
        assert_eq!(
            h.pipeline.availability().await,
            Availability::Paused {
                until: shanghai(20, 9)
            }
        );

        // identity was released, but the paused state blocks the retry
        let retry = h.pipeline.process(message(5, "job post")).await;
        assert_eq!(retry, Disposition::Skipped(SkipReason::Paused));
        let snap = h.pipeline.snapshot().await;
        assert_eq!(snap.consecutive_errors, 1);
        assert!(snap.paused);
        assert_eq!(snap.pause_until.as_deref(), Some("2026-10-20 09:00:00"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_flood_wait_is_honored_exactly() {
        let h = harness();
        h.transport
            .fail_deliveries(vec![Some(TransportError::flood_wait(120))]);

        let start = Instant::now();
        let outcome = h.pipeline.process(message(6, "job post")).await;
        assert_eq!(
            outcome,
            Disposition::Attempted(DeliveryOutcome::Deferred(Duration::from_secs(120)))
        );
        assert!(start.elapsed() >= Duration::from_secs(121));
        assert_eq!(h.pipeline.availability().await, Availability::Active);

        // released identity can be retried
        let retry = h.pipeline.process(message(6, "job post")).await;
        assert_eq!(retry, Disposition::Attempted(DeliveryOutcome::Delivered));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_pauses() {
        let h = harness();
        h.transport
            .fail_deliveries(vec![Some(TransportError::api("USER_DEACTIVATED"))]);
        let outcome = h.pipeline.process(message(7, "post")).await;
        assert_eq!(
            outcome,
            Disposition::Attempted(DeliveryOutcome::Rejected(ErrorClass::Fatal))
        );
        assert!(h.pipeline.availability().await.is_paused());
        assert_eq!(h.pipeline.snapshot().await.consecutive_errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_sleep_is_capped() {
        let h = harness();
        h.transport
            .fail_deliveries(vec![Some(TransportError::network("connection reset"))]);
        let outcome = h.pipeline.process(message(8, "post")).await;
        assert_eq!(
            outcome,
            Disposition::Attempted(DeliveryOutcome::Deferred(Duration::from_secs(60)))
        );
        let snap = h.pipeline.snapshot().await;
        assert_eq!(snap.consecutive_errors, 1);
        assert!((snap.delay_multiplier - 2.0).abs() < 1e-9);
        assert_eq!(snap.rate.minute.count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dangerous_error_escalates_when_cooldown_too_long() {
        let h = harness();
        let dangerous = || Some(TransportError::api("CHAT_WRITE_FORBIDDEN"));
        h.transport.fail_deliveries(vec![dangerous(), dangerous(), dangerous()]);

        // 120s, 240s, then 480s stay below the 600s threshold
        for (id, secs) in [(10, 120), (11, 240), (12, 480)] {
            let outcome = h.pipeline.process(message(id, "post")).await;
            assert_eq!(
                outcome,
                Disposition::Attempted(DeliveryOutcome::Deferred(Duration::from_secs(secs)))
            );
        }

        h.transport.fail_deliveries(vec![dangerous()]);
        let outcome = h.pipeline.process(message(13, "post")).await;
        assert_eq!(
            outcome,
            Disposition::Attempted(DeliveryOutcome::Rejected(ErrorClass::Dangerous))
        );
        assert!(h.pipeline.availability().await.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entity_error_falls_back_to_plain_text() {
        let h = harness();
        h.transport.fail_deliveries(vec![Some(TransportError::entity_bounds(
            "can't parse entities",
        ))]);
        let outcome = h.pipeline.process(message(9, "a <b> tag")).await;
        assert_eq!(
            outcome,
            Disposition::Attempted(DeliveryOutcome::DeliveredDegraded(DegradeReason::PlainText))
        );

        let formatting: Vec<bool> = h
            .transport
            .calls()
            .iter()
            .filter_map(|c| match c {
                Call::Deliver { formatting, .. } => Some(*formatting),
                _ => None,
            })
            .collect();
        assert_eq!(formatting, vec![true, false]);
        assert_eq!(h.pipeline.snapshot().await.consecutive_errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_forwarded_natively() {
        let h = harness();
        let outcome = h.pipeline.process(photo_message(20)).await;
        assert_eq!(outcome, Disposition::Attempted(DeliveryOutcome::Delivered));
        assert_eq!(
            h.transport.calls()[1],
            Call::Forward {
                destination: "@target".to_string(),
                message_id: 20
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_reupload_after_forward_failure() {
        let h = harness();
        h.transport
            .fail_forwards(vec![Some(TransportError::api("CHAT_FORWARDS_RESTRICTED"))]);
        let outcome = h.pipeline.process(photo_message(21)).await;
        assert_eq!(
            outcome,
            Disposition::Attempted(DeliveryOutcome::DeliveredDegraded(
                DegradeReason::MediaReuploaded
            ))
        );
        let calls = h.transport.calls();
        assert_eq!(calls.len(), 3);
        assert!(matches!(&calls[2], Call::Deliver { media: true, formatting: false, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_failure_at_every_stage_keeps_text_success() {
        let h = harness();
        h.transport
            .fail_forwards(vec![Some(TransportError::api("forward failed"))]);
        h.transport.fail_deliveries(vec![
            None,
            Some(TransportError::api("upload failed")),
            Some(TransportError::api("note failed")),
        ]);
        let outcome = h.pipeline.process(photo_message(22)).await;
        assert_eq!(
            outcome,
            Disposition::Attempted(DeliveryOutcome::DeliveredDegraded(
                DegradeReason::MediaDropped
            ))
        );
        let snap = h.pipeline.snapshot().await;
        assert_eq!(snap.rate.minute.count, 1);
        assert_eq!(snap.consecutive_errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_note_mentions_media() {
        let h = harness();
        h.transport
            .fail_forwards(vec![Some(TransportError::api("forward failed"))]);
        h.transport
            .fail_deliveries(vec![None, Some(TransportError::api("upload failed"))]);
        let outcome = h.pipeline.process(photo_message(23)).await;
        assert_eq!(
            outcome,
            Disposition::Attempted(DeliveryOutcome::DeliveredDegraded(
                DegradeReason::MediaNoteOnly
            ))
        );
        let Some(Call::Deliver { text, .. }) = h.transport.calls().last().cloned() else {
            panic!("expected a deliver call");
        };
        assert!(text.contains("contained photo, which could not be relayed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_ceiling_skips() {
        let mut config = test_config();
        config.rate.per_minute = 1;
        let h = harness_with(config);

        let first = h.pipeline.process(message(30, "one")).await;
        let second = h.pipeline.process(message(31, "two")).await;
        assert_eq!(first, Disposition::Attempted(DeliveryOutcome::Delivered));
        assert_eq!(second, Disposition::Skipped(SkipReason::RateLimited));
        assert_eq!(h.transport.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsafe_hour_skips() {
        let mut config = test_config();
        config.schedule.off_hours_probability = 1.0;
        let h = harness_with(config);
        *h.clock.lock().unwrap() = shanghai(19, 3);

        let outcome = h.pipeline.process(message(40, "night post")).await;
        assert_eq!(outcome, Disposition::Skipped(SkipReason::UnsafeHour));
        assert!(h.transport.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_off_hours_drop() {
        let mut config = test_config();
        config.schedule.off_hours_probability = 0.0;
        let h = harness_with(config);
        *h.clock.lock().unwrap() = shanghai(19, 20);

        let outcome = h.pipeline.process(message(41, "evening post")).await;
        assert_eq!(outcome, Disposition::Skipped(SkipReason::OutsideWorkWindow));
    }

    #[tokio::test(start_paused = true)]
    async fn test_relayed_log_is_ignored() {
        let h = harness();
        let text = format!("{}\nINFO relayed", LOG_MARKER);
        let outcome = h.pipeline.process(message(50, &text)).await;
        assert_eq!(outcome, Disposition::Skipped(SkipReason::RelayedLog));
        assert_eq!(h.pipeline.snapshot().await.dedup_size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_requires_deadline_and_work_hour() {
        let h = harness();
        h.transport
            .fail_deliveries(vec![Some(TransportError::api("PEER_FLOOD"))]);
        h.pipeline.process(message(60, "post")).await;
        assert!(h.pipeline.availability().await.is_paused());

        assert!(!h.pipeline.try_resume().await);

        // deadline reached at 09:00 next day
        *h.clock.lock().unwrap() = shanghai(20, 9);
        assert!(h.pipeline.try_resume().await);
        assert_eq!(h.pipeline.availability().await, Availability::Active);
        assert!(!h.pipeline.try_resume().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_waits_for_work_hour() {
        let h = harness();
        h.transport
            .fail_deliveries(vec![Some(TransportError::api("USER_DEACTIVATED"))]);
        h.pipeline.process(message(61, "post")).await;

        // past the deadline but outside the work window
        *h.clock.lock().unwrap() = shanghai(20, 19);
        assert!(!h.pipeline.try_resume().await);
        *h.clock.lock().unwrap() = shanghai(21, 10);
        assert!(h.pipeline.try_resume().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_delay_unwinds() {
        let h = harness();
        let (outcome, _) = tokio::join!(h.pipeline.process(message(70, "post")), async {
            h.cancel.cancel();
        });
        assert_eq!(outcome, Disposition::Skipped(SkipReason::ShuttingDown));
        assert!(h.transport.calls().is_empty());
        assert_eq!(h.pipeline.snapshot().await.dedup_size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_pipeline_admits_nothing() {
        let h = harness();
        h.cancel.cancel();
        let outcome = h.pipeline.process(message(71, "post")).await;
        assert_eq!(outcome, Disposition::Skipped(SkipReason::ShuttingDown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_drains_stream() {
        let h = harness();
        h.transport
            .incoming
            .lock()
            .unwrap()
            .extend([message(80, "a"), message(80, "a again"), message(81, "b")]);

        Arc::clone(&h.pipeline)
            .run(&["@chanA".to_string()])
            .await
            .unwrap();
        assert_eq!(h.transport.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multiple_destinations() {
        let mut config = test_config();
        config.telegram.destinations = vec!["@one".into(), "@two".into()];
        let h = harness_with(config);
        h.pipeline.process(message(90, "post")).await;

        let destinations: Vec<String> = h
            .transport
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Deliver { destination, .. } => Some(destination),
                _ => None,
            })
            .collect();
        assert_eq!(destinations, vec!["@one", "@two"]);
        assert_eq!(h.pipeline.snapshot().await.rate.minute.count, 1);
    }

    fn two_destinations() -> Config {
        let mut config = test_config();
        config.telegram.destinations = vec!["@one".into(), "@two".into()];
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_formatted_send_escapes_markup() {
        let h = harness();
        let outcome = h
            .pipeline
            .process(message(95, "senior dev <remote> & relocation"))
            .await;
        assert_eq!(outcome, Disposition::Attempted(DeliveryOutcome::Delivered));

        let calls = h.transport.calls();
        assert_eq!(calls.len(), 1);
        let Call::Deliver {
            text,
            formatting: true,
            ..
        } = &calls[0]
        else {
            panic!("expected a formatted deliver call");
        };
        assert!(text.ends_with("senior dev &lt;remote&gt; &amp; relocation"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_through_run_respects_rate_ceiling() {
        let mut config = test_config();
        config.rate.per_minute = 3;
        config.delay.burst_penalty_secs = 0.0;
        let h = harness_with(config);
        h.transport
            .incoming
            .lock()
            .unwrap()
            .extend((100..106).map(|id| message(id, "media group part")));

        Arc::clone(&h.pipeline)
            .run(&["@chanA".to_string()])
            .await
            .unwrap();
        assert_eq!(h.transport.calls().len(), 3);
        assert_eq!(h.pipeline.snapshot().await.rate.minute.count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flood_wait_holds_back_other_messages() {
        let h = harness();
        h.transport
            .fail_deliveries(vec![Some(TransportError::flood_wait(120))]);

        let start = Instant::now();
        let (first, second) = tokio::join!(h.pipeline.process(message(110, "first")), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            h.pipeline.process(message(111, "second")).await
        });
        assert_eq!(
            first,
            Disposition::Attempted(DeliveryOutcome::Deferred(Duration::from_secs(120)))
        );
        assert_eq!(second, Disposition::Attempted(DeliveryOutcome::Delivered));

        let stamps = h.transport.stamps();
        assert_eq!(stamps.len(), 2);
        assert!(stamps[1] - start >= Duration::from_secs(121));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_destination_failure_is_not_resent() {
        let h = harness_with(two_destinations());
        h.transport.fail_deliveries(vec![
            None,
            Some(TransportError::network("connection reset")),
        ]);

        let first = h.pipeline.process(message(120, "post")).await;
        assert_eq!(
            first,
            Disposition::Attempted(DeliveryOutcome::Deferred(Duration::from_secs(60)))
        );
        let snap = h.pipeline.snapshot().await;
        assert_eq!(snap.rate.minute.count, 1);
        assert_eq!(snap.dedup_size, 1);

        let retry = h.pipeline.process(message(120, "post")).await;
        assert_eq!(retry, Disposition::Skipped(SkipReason::Duplicate));
        assert_eq!(h.transport.deliveries_to("@one"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pre_send_delay_is_capped() {
        let mut config = test_config();
        config.delay.min_secs = 300.0;
        config.delay.max_secs = 400.0;
        config.backoff.max_wait_secs = 30;
        let h = harness_with(config);

        let start = Instant::now();
        let outcome = h.pipeline.process(message(130, "post")).await;
        assert_eq!(outcome, Disposition::Attempted(DeliveryOutcome::Delivered));
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert!(start.elapsed() < Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_skips_remaining_destinations() {
        let h = harness_with(two_destinations());
        h.transport.cancel_after(1, h.cancel.clone());

        let outcome = h.pipeline.process(message(140, "post")).await;
        assert_eq!(
            outcome,
            Disposition::Attempted(DeliveryOutcome::DeliveredDegraded(
                DegradeReason::PartialDestinations
            ))
        );
        assert_eq!(h.transport.calls().len(), 1);
        let snap = h.pipeline.snapshot().await;
        assert_eq!(snap.rate.minute.count, 1);
        assert_eq!(snap.dedup_size, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_between_media_stages() {
        let h = harness();
        h.transport
            .fail_forwards(vec![Some(TransportError::api("forward failed"))]);
        h.transport.cancel_after(2, h.cancel.clone());

        let outcome = h.pipeline.process(photo_message(141)).await;
        assert_eq!(
            outcome,
            Disposition::Attempted(DeliveryOutcome::DeliveredDegraded(
                DegradeReason::MediaDropped
            ))
        );
        // text and the failed forward; no re-upload, no note
        assert_eq!(h.transport.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_penalty_after_recent_send() {
        let h = harness();
        h.pipeline.process(message(150, "one")).await;

        let start = Instant::now();
        let second = h.pipeline.process(message(151, "two")).await;
        assert_eq!(second, Disposition::Attempted(DeliveryOutcome::Delivered));
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(45));
        assert!(waited < Duration::from_secs(48));
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_waits_share_of_delay() {
        let h = harness();
        let start = Instant::now();
        h.pipeline.process(photo_message(160)).await;

        let stamps = h.transport.stamps();
        assert_eq!(stamps.len(), 2);
        let expected = (stamps[0] - start).mul_f64(MEDIA_DELAY_FACTOR);
        let gap = stamps[1] - stamps[0];
        let slack = Duration::from_millis(3);
        assert!(gap + slack >= expected);
        assert!(gap <= expected + slack);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_cooldown_returns_promptly() {
        let h = harness();
        h.transport
            .fail_deliveries(vec![Some(TransportError::flood_wait(120))]);

        let start = Instant::now();
        let (outcome, _) = tokio::join!(h.pipeline.process(message(170, "post")), async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            h.cancel.cancel();
        });
        assert_eq!(
            outcome,
            Disposition::Attempted(DeliveryOutcome::Deferred(Duration::from_secs(120)))
        );
        assert!(start.elapsed() < Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reupload_caption_is_cut_to_caption_limit() {
        let h = harness();
        h.transport
            .fail_forwards(vec![Some(TransportError::api("forward failed"))]);
        let mut long_post = photo_message(180);
        long_post.text = Some("word ".repeat(600));

        let outcome = h.pipeline.process(long_post).await;
        assert_eq!(
            outcome,
            Disposition::Attempted(DeliveryOutcome::DeliveredDegraded(
                DegradeReason::MediaReuploaded
            ))
        );
        let caption = h
            .transport
            .calls()
            .into_iter()
            .find_map(|c| match c {
                Call::Deliver {
                    text, media: true, ..
                } => Some(text),
                _ => None,
            })
            .unwrap();
        assert_eq!(caption.chars().count(), sanitize::MAX_CAPTION_CHARS);
    }
}
