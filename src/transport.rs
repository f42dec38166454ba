//! The isochronous transport
//!
//! [`StreamTransport`] owns every piece of transport state: the channel table,
//! the transmit budgets, the retry queue, the stereo timing coordinator and the
//! state machine of the configured role. Stack callbacks come in through
//! [`StreamTransport::handle_event`]; the actions the state machine asks for are
//! executed against the [`IsoBackend`] right away.
//!
//! The audio path ([`StreamTransport::send`], [`StreamTransport::on_iso_sent`],
//! [`StreamTransport::on_iso_received`]) only takes `&self`. The budgets are
//! atomic, so sends need no exclusive access to the transport.

use core::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use bt_hci::param::{ConnHandle, DisconnectReason};
use heapless::{Deque, Vec};

use crate::constants::{HCI_ERR_CONN_FAIL_TO_ESTAB, MAX_CHANNELS, MAX_ISO_PAYLOAD, QUEUE_DEPTH};
use crate::log::{debug, error, info, warn};
use crate::role::{ActiveRole, RoleContext};
use crate::{
    Action, AudioRoleBehavior, BackendError, ChannelRegistry, ChannelSelector,
    ConnectionRetryScheduler, IsoBackend, IsoRxCallback, LeAudioEvent, RetryOp, RetryOutcome,
    RetryWorkItem, ScanMode, SendTiming, StackEvent, StreamState, TimingCoordinator, Transition,
    TransportError, TransportKind, TransportOptions, TxBufferPool,
};

/// Received-audio counters since the previous report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RxStatsSnapshot {
    /// Frames received
    pub total: u32,
    /// Frames flagged as bad by the controller
    pub bad: u32,
}

impl RxStatsSnapshot {
    /// Share of bad frames in tenths of a percent
    #[must_use]
    pub fn bad_permille(&self) -> u32 {
        if self.total == 0 {
            return 0;
        }
        (u64::from(self.bad) * 1000 / u64::from(self.total)) as u32
    }
}

/// Outcome of one [`StreamTransport::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SendReport {
    /// SDUs handed to the controller
    pub sent: u8,
    /// SDUs dropped (budget full, flush in progress or channel not connected)
    pub dropped: u8,
}

/// Work done by one [`StreamTransport::poll`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollOutcome {
    /// Events to publish, in order
    pub events: Vec<LeAudioEvent, QUEUE_DEPTH>,
    /// Failures that ended a channel setup
    pub errors: Vec<TransportError, MAX_CHANNELS>,
}

impl PollOutcome {
    fn publish(&mut self, transition: Transition) {
        for event in transition.events {
            if self.events.push(event).is_err() {
                warn!("[TRANSPORT] Event {} dropped, poll outcome full", event);
            }
        }
    }
}

/// LE Audio isochronous transport for one device role
pub struct StreamTransport<B: IsoBackend> {
    options: TransportOptions,
    backend: B,
    registry: ChannelRegistry,
    pool: TxBufferPool,
    retry: ConnectionRetryScheduler,
    timing: TimingCoordinator,
    role: ActiveRole,
    rx_callback: Option<IsoRxCallback>,
    rx_total: AtomicU32,
    rx_bad: AtomicU32,
    pattern: [AtomicU8; MAX_CHANNELS],
    /// Stack events raised by failed actions, handled on the next poll
    internal: Deque<StackEvent, QUEUE_DEPTH>,
    next_rx_stats_ms: Option<u64>,
}

impl<B: IsoBackend> StreamTransport<B> {
    /// Create a transport for `options` on top of `backend`
    ///
    /// # Errors
    /// Returns `TransportError::InvalidParameter` if the options do not validate.
    pub fn new(options: TransportOptions, backend: B) -> Result<Self, TransportError> {
        options.validate()?;

        let now_ms = backend.now_ms();
        let next_rx_stats_ms = (options.rx_stats_interval_s > 0)
            .then(|| now_ms + u64::from(options.rx_stats_interval_s) * 1000);

        info!(
            "[TRANSPORT] {} {} with {} channel(s)",
            options.role, options.kind, options.channel_count
        );
        Ok(Self {
            registry: ChannelRegistry::new(options.channel_count, options.kind, options.direction),
            pool: TxBufferPool::new(options.channel_count),
            retry: ConnectionRetryScheduler::new(options.retry),
            timing: TimingCoordinator::new(options.timing),
            role: ActiveRole::new(&options),
            rx_callback: None,
            rx_total: AtomicU32::new(0),
            rx_bad: AtomicU32::new(0),
            pattern: [const { AtomicU8::new(0) }; MAX_CHANNELS],
            internal: Deque::new(),
            next_rx_stats_ms,
            options,
            backend,
        })
    }

    /// Register the received-audio callback
    ///
    /// # Errors
    /// Returns `TransportError::AlreadyInitialized` if a callback is registered.
    pub fn set_receive_callback(&mut self, callback: IsoRxCallback) -> Result<(), TransportError> {
        if self.rx_callback.is_some() {
            return Err(TransportError::AlreadyInitialized);
        }
        self.rx_callback = Some(callback);
        Ok(())
    }

    /// Configured options
    #[must_use]
    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// The LE host stack
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Channel table
    #[must_use]
    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Transmit budgets
    #[must_use]
    pub fn pool(&self) -> &TxBufferPool {
        &self.pool
    }

    /// Pending retries
    #[must_use]
    pub fn retry(&self) -> &ConnectionRetryScheduler {
        &self.retry
    }

    /// State machine of the configured role
    #[must_use]
    pub fn role(&self) -> &ActiveRole {
        &self.role
    }

    /// Current time of the LE host stack in milliseconds
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.backend.now_ms()
    }

    /// Lifecycle state of the configured role
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.role.state()
    }

    fn step<R>(&mut self, f: impl FnOnce(&mut ActiveRole, &mut RoleContext<'_>) -> R) -> R {
        let mut ctx = RoleContext {
            registry: &mut self.registry,
            pool: &self.pool,
            retry: &mut self.retry,
            timing: &self.timing,
            now_ms: self.backend.now_ms(),
        };
        f(&mut self.role, &mut ctx)
    }

    /// Start the configured role
    ///
    /// Returns the executed transition; its events are for the caller to publish.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidState` if the role cannot start now.
    pub fn start(&mut self) -> Result<Transition, TransportError> {
        let transition = self.step(|role, ctx| role.start(ctx))?;
        Ok(self.apply(transition))
    }

    /// Stop the configured role
    ///
    /// # Errors
    /// Returns `TransportError::InvalidState` if the role is not running.
    pub fn stop(&mut self) -> Result<Transition, TransportError> {
        let transition = self.step(|role, ctx| role.stop(ctx))?;
        Ok(self.apply(transition))
    }

    /// Provide the broadcast code of an encrypted BIG
    ///
    /// # Errors
    /// Returns `TransportError::NotSupported` unless the role is a broadcast sink.
    pub fn set_broadcast_code(
        &mut self,
        code: [u8; crate::constants::BROADCAST_CODE_LENGTH],
    ) -> Result<Transition, TransportError> {
        let transition = self.role.set_broadcast_code(code)?;
        Ok(self.apply(transition))
    }

    /// Feed one stack callback to the state machine and execute its action
    ///
    /// Returns the executed transition; its events are for the caller to publish.
    pub fn handle_event(&mut self, event: &StackEvent) -> Transition {
        let transition = match *event {
            StackEvent::IsoSent { channel } => {
                if self.on_iso_sent(channel).is_err() {
                    warn!("[TRANSPORT] Sent event for unknown channel {}", channel);
                }
                return Transition::none();
            }
            StackEvent::IsoConnected { channel } => {
                self.step(|role, ctx| role.on_connected(ctx, channel))
            }
            StackEvent::IsoDisconnected { channel, reason } => {
                self.step(|role, ctx| role.on_disconnected(ctx, channel, reason))
            }
            _ => self.step(|role, ctx| role.on_event(ctx, event)),
        };
        self.apply(transition)
    }

    fn apply(&mut self, transition: Transition) -> Transition {
        if let Some(action) = transition.action {
            if let Err(e) = self.execute(action) {
                error!("[TRANSPORT] {} failed: {}", action, e);
                self.on_action_failed(action, e);
            }
        }
        transition
    }

    fn execute(&mut self, action: Action) -> Result<(), TransportError> {
        debug!("[TRANSPORT] Executing {}", action);
        let backend = &self.backend;
        let channels = self.registry.len();
        match action {
            Action::StartScan(mode) => backend.scan_start(mode)?,
            Action::StopScan => backend.scan_stop()?,
            Action::StartAdvertising => backend.adv_start()?,
            Action::StopAdvertising => backend.adv_stop()?,
            Action::ConnectAcl(peer) => {
                if let Err(e) = backend.scan_stop() {
                    warn!("[TRANSPORT] Stop scanning failed: {}", e);
                }
                backend.acl_create(peer)?;
            }
            Action::SetSecurity { acl } => backend.set_security(ConnHandle::new(acl))?,
            Action::ExchangeMtu { acl } => backend.exchange_mtu(ConnHandle::new(acl))?,
            Action::DiscoverSink { acl } => backend.discover_sink(ConnHandle::new(acl))?,
            Action::ConfigureCodec { channel, acl } => {
                backend.stream_config(channel, ConnHandle::new(acl))?;
            }
            Action::ConfigureQos { channel, acl } => {
                backend.stream_qos(channel, ConnHandle::new(acl))?;
            }
            Action::EnableStream { channel } => backend.stream_enable(channel)?,
            Action::EnableStreams { mask } => {
                for_each_channel(mask, channels, |ch| backend.stream_enable(ch))?;
            }
            Action::DisableStreams { mask } => {
                for_each_channel(mask, channels, |ch| backend.stream_disable(ch))?;
            }
            Action::ScheduleCisConnect { channel } => {
                let now_ms = backend.now_ms();
                self.retry.schedule(channel, RetryOp::CisConnect, now_ms)?;
            }
            Action::ScheduleStreamStart { channel } => {
                let now_ms = backend.now_ms();
                self.retry.schedule(channel, RetryOp::StreamStart, now_ms)?;
            }
            Action::Disconnect { acl, cause } => {
                backend.acl_disconnect(ConnHandle::new(acl), cause.into())?;
            }
            Action::CreateBroadcastSource => backend.broadcast_source_create()?,
            Action::StartExtendedAdvertising => backend.ext_adv_start()?,
            Action::StartPeriodicAdvertising => backend.per_adv_start()?,
            Action::CreateBig { num_bis } => backend.big_create(num_bis)?,
            Action::TerminateBig => backend.big_terminate()?,
            Action::CreatePaSync {
                peer,
                sid,
                timeout_10ms,
            } => {
                if let Err(e) = backend.scan_stop() {
                    warn!("[TRANSPORT] Stop scanning failed: {}", e);
                }
                backend.pa_sync_create(peer, sid, timeout_10ms)?;
            }
            Action::SyncBig {
                bis_bitfield,
                broadcast_code,
            } => backend.big_sync(bis_bitfield, broadcast_code.as_ref())?,
            Action::DeletePaSync => backend.pa_sync_delete()?,
            Action::RestartScan { delete_pa_sync } => {
                if delete_pa_sync {
                    if let Err(e) = backend.pa_sync_delete() {
                        warn!("[TRANSPORT] Deleting PA sync failed: {}", e);
                    }
                }
                backend.scan_start(ScanMode::PeriodicAdvertisers)?;
            }
        }
        Ok(())
    }

    /// Turn a failed action into the stack event or teardown that follows it
    fn on_action_failed(&mut self, action: Action, err: TransportError) {
        let status = match err {
            TransportError::Backend(BackendError::Hci(status)) => status,
            _ => HCI_ERR_CONN_FAIL_TO_ESTAB,
        };

        let follow_up = match action {
            Action::ConnectAcl(peer) => Some(StackEvent::AclConnectFailed { peer, status }),
            Action::CreatePaSync { .. } => Some(StackEvent::PaSyncLost { reason: status }),
            Action::SyncBig { .. } => Some(StackEvent::IsoDisconnected { channel: 0, reason: status }),
            Action::SetSecurity { acl }
            | Action::ExchangeMtu { acl }
            | Action::DiscoverSink { acl }
            | Action::ConfigureCodec { acl, .. }
            | Action::ConfigureQos { acl, .. } => {
                self.teardown_link(acl);
                None
            }
            Action::ScheduleCisConnect { channel } | Action::ScheduleStreamStart { channel } => {
                if let Some(acl) = self.registry.channel(channel).ok().and_then(|c| c.peer) {
                    self.teardown_link(acl);
                }
                None
            }
            _ => None,
        };

        if let Some(event) = follow_up {
            if self.internal.push_back(event).is_err() {
                warn!("[TRANSPORT] Internal event queue full");
            }
        }
    }

    /// Disconnect a link whose setup cannot continue
    fn teardown_link(&self, acl: u16) {
        warn!("[TRANSPORT] Tearing down connection {}", acl);
        if let Err(e) = self
            .backend
            .acl_disconnect(ConnHandle::new(acl), DisconnectReason::RemoteUserTerminatedConn)
        {
            error!("[TRANSPORT] Disconnect of {} failed: {}", acl, e);
        }
    }

    fn attempt(&self, item: &RetryWorkItem) -> Result<(), BackendError> {
        match item.op {
            RetryOp::CisConnect => {
                let acl = self
                    .registry
                    .channel(item.channel)
                    .ok()
                    .and_then(|c| c.peer)
                    .ok_or(BackendError::NoLink)?;
                debug!("[TRANSPORT] Connecting CIS {} (attempt {})", item.channel, item.retries + 1);
                self.backend.iso_connect(item.channel, ConnHandle::new(acl))
            }
            RetryOp::StreamStart => {
                debug!("[TRANSPORT] Starting stream {} (attempt {})", item.channel, item.retries + 1);
                self.backend.stream_start(item.channel)
            }
        }
    }

    fn run_due_retries(&mut self, now_ms: u64, outcome: &mut PollOutcome) {
        for _ in 0..MAX_CHANNELS {
            let Some(item) = self.retry.take_due(now_ms) else {
                break;
            };
            let result = self.attempt(&item);
            if let RetryOutcome::Exhausted { channel, op } =
                self.retry.complete(item, result, now_ms)
            {
                error!("[TRANSPORT] {} on channel {} exhausted", op, channel);
                if let Some(acl) = self.registry.channel(channel).ok().and_then(|c| c.peer) {
                    self.teardown_link(acl);
                }
                if outcome.errors.push(TransportError::RetriesExhausted).is_err() {
                    warn!("[TRANSPORT] Error dropped, poll outcome full");
                }
            }
        }
    }

    /// Run everything that is due: queued internal events, retries, role
    /// deadlines and the RX statistics report
    pub fn poll(&mut self) -> PollOutcome {
        let mut outcome = PollOutcome::default();

        for _ in 0..QUEUE_DEPTH {
            let Some(event) = self.internal.pop_front() else {
                break;
            };
            let transition = self.handle_event(&event);
            outcome.publish(transition);
        }

        let now_ms = self.backend.now_ms();
        self.run_due_retries(now_ms, &mut outcome);

        let transition = self.step(|role, ctx| role.on_tick(ctx));
        let transition = self.apply(transition);
        outcome.publish(transition);

        if let Some(due) = self.next_rx_stats_ms {
            if now_ms >= due {
                let stats = self.take_rx_stats();
                warn!(
                    "[TRANSPORT] ISO RX tot: {} bad: {} ({} permille)",
                    stats.total,
                    stats.bad,
                    stats.bad_permille()
                );
                self.next_rx_stats_ms =
                    Some(now_ms + u64::from(self.options.rx_stats_interval_s) * 1000);
            }
        }

        outcome
    }

    /// Earliest time [`Self::poll`] has work to do
    #[must_use]
    pub fn next_deadline(&self) -> Option<u64> {
        if !self.internal.is_empty() {
            return Some(self.backend.now_ms());
        }
        [
            self.retry.next_deadline(),
            self.role.next_deadline(),
            self.next_rx_stats_ms,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Send one audio frame
    ///
    /// A broadcast source sends the whole payload on its first BIS regardless of
    /// `selector`. For `Stereo` the payload holds the left half followed by the
    /// right half. Frames for a channel whose budget is full, or that is not
    /// connected, are dropped and counted in the report.
    ///
    /// # Errors
    /// Returns `TransportError::NotSupported` on a receive-only transport,
    /// `TransportError::InvalidParameter` for an empty, oversized or (stereo)
    /// odd-length payload, `TransportError::InvalidChannel` if the selected
    /// channel is not configured, and `TransportError::Backend` if the stack
    /// refused an SDU.
    pub fn send(
        &self,
        payload: &[u8],
        selector: ChannelSelector,
    ) -> Result<SendReport, TransportError> {
        if !self.options.direction.transmits() {
            return Err(TransportError::NotSupported);
        }
        if payload.is_empty() {
            return Err(TransportError::InvalidParameter);
        }

        let mut report = SendReport::default();
        if self.options.kind == TransportKind::Bis {
            self.send_on(0, payload, &mut report)?;
            return Ok(report);
        }

        match selector {
            ChannelSelector::Stereo => self.send_stereo(payload, &mut report)?,
            ChannelSelector::Left | ChannelSelector::Mono => self.send_on(0, payload, &mut report)?,
            ChannelSelector::Right => self.send_on(1, payload, &mut report)?,
        }
        Ok(report)
    }

    fn send_stereo(&self, payload: &[u8], report: &mut SendReport) -> Result<(), TransportError> {
        if self.registry.len() < 2 {
            return Err(TransportError::InvalidChannel);
        }
        if payload.len() % 2 != 0 {
            return Err(TransportError::InvalidParameter);
        }

        if self.pool.flush_pending() {
            // Hold both channels until every in-flight SDU has gone out
            self.pool.complete_flush();
            report.dropped += 2;
            return Ok(());
        }

        let connected = self.registry.connected_count();
        let anchor_channel = self.registry.first_connected().unwrap_or(0);
        let timing = self.timing.plan(
            self.backend.now_ms(),
            self.backend.now_us(),
            connected,
            || self.backend.read_iso_tx_anchor(anchor_channel),
        );
        if let SendTiming::Delay { us } = timing {
            self.backend.delay_us(us);
        }

        let (left, right) = payload.split_at(payload.len() / 2);
        self.send_on(0, left, report)?;
        self.send_on(1, right, report)
    }

    fn send_on(&self, channel: usize, data: &[u8], report: &mut SendReport) -> Result<(), TransportError> {
        if data.len() > MAX_ISO_PAYLOAD {
            return Err(TransportError::InvalidParameter);
        }
        if !self.registry.state(channel)?.is_connected() || !self.pool.try_reserve(channel)? {
            report.dropped += 1;
            return Ok(());
        }

        let result = if self.options.test_pattern {
            let value = self.pattern[channel].load(Ordering::Relaxed);
            let buf = [value; MAX_ISO_PAYLOAD];
            let result = self.backend.iso_send(channel, &buf[..data.len()]);
            if result.is_ok() {
                self.pattern[channel].store(value.wrapping_add(1), Ordering::Relaxed);
            }
            result
        } else {
            self.backend.iso_send(channel, data)
        };

        match result {
            Ok(()) => {
                report.sent += 1;
                Ok(())
            }
            Err(e) => {
                error!("[TRANSPORT] Unable to send ISO data on channel {}: {}", channel, e);
                self.pool.release(channel)?;
                Err(e.into())
            }
        }
    }

    /// An SDU on `channel` has been sent and its buffer freed
    ///
    /// # Errors
    /// Returns `TransportError::InvalidChannel` if `channel` is out of range.
    pub fn on_iso_sent(&self, channel: usize) -> Result<(), TransportError> {
        self.pool.release(channel)
    }

    /// Audio received on `channel`
    ///
    /// # Errors
    /// Returns `TransportError::InvalidChannel` if `channel` is out of range and
    /// `TransportError::NoReceiveCallback` if no callback is registered.
    pub fn on_iso_received(
        &self,
        channel: usize,
        data: &[u8],
        bad_frame: bool,
        timestamp: u32,
    ) -> Result<(), TransportError> {
        self.registry.channel(channel)?;
        let Some(callback) = self.rx_callback else {
            error!("[TRANSPORT] Audio received but no receive callback is set");
            return Err(TransportError::NoReceiveCallback);
        };

        self.rx_total.fetch_add(1, Ordering::Relaxed);
        if bad_frame {
            self.rx_bad.fetch_add(1, Ordering::Relaxed);
        }
        callback(data, bad_frame, timestamp, channel);
        Ok(())
    }

    /// Read and reset the RX statistics
    pub fn take_rx_stats(&self) -> RxStatsSnapshot {
        RxStatsSnapshot {
            total: self.rx_total.swap(0, Ordering::Relaxed),
            bad: self.rx_bad.swap(0, Ordering::Relaxed),
        }
    }
}

/// Run `f` for every configured channel in `mask`, returning the first error
fn for_each_channel(
    mask: u8,
    channels: usize,
    mut f: impl FnMut(usize) -> Result<(), BackendError>,
) -> Result<(), BackendError> {
    let mut result = Ok(());
    for channel in (0..channels).filter(|ch| mask & (1 << ch) != 0) {
        if let Err(e) = f(channel) {
            warn!("[TRANSPORT] Channel {}: {}", channel, e);
            result = result.and(Err(e));
        }
    }
    result
}
