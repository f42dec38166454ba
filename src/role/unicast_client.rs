//! Gateway CIS state machine (unicast client)
//!
//! The gateway scans for headsets advertising the configured name, connects,
//! secures the link and sets up one CIS per headset. Two setup flows are
//! supported:
//!
//! * **Direct**: security, MTU exchange, then a CIS connect through the retry
//!   scheduler. The CIS carries audio as soon as it is up.
//! * **Stream discovery**: security, sink discovery (which assigns the channel
//!   from the headset's audio location), codec and QoS configuration, enable,
//!   then a stream start through the retry scheduler.
//!
//! Scanning resumes whenever a channel has no headset, so the second headset
//! is picked up after the first one is streaming.

use crate::adv::matches_peer_name;
use crate::constants::MAX_CHANNELS;
use crate::log::{debug, error, info, warn};
use crate::role::{Action, AudioRoleBehavior, DisconnectCause, RoleContext, StreamState, Transition};
use crate::{ChannelState, LeAddress, LeAudioEvent, ScanMode, StackEvent, TransportError, TransportOptions};

/// Gateway CIS state machine
#[derive(Debug)]
pub struct UnicastClient {
    peer_name: &'static str,
    stream_discovery: bool,
    play_on_connect: bool,
    started: bool,
    playing: bool,
    scanning: bool,
    connecting: Option<LeAddress>,
    phases: [StreamState; MAX_CHANNELS],
    link_announced: bool,
    streaming_announced: bool,
}

impl UnicastClient {
    /// Create an idle gateway
    #[must_use]
    pub fn new(options: &TransportOptions) -> Self {
        Self {
            peer_name: options.peer_name,
            stream_discovery: options.stream_discovery,
            play_on_connect: options.play_on_connect,
            started: false,
            playing: options.play_on_connect,
            scanning: false,
            connecting: None,
            phases: [StreamState::Idle; MAX_CHANNELS],
            link_announced: false,
            streaming_announced: false,
        }
    }

    /// Lifecycle state of one channel
    #[must_use]
    pub fn channel_state(&self, channel: usize) -> Option<StreamState> {
        self.phases.get(channel).copied()
    }

    /// Whether streams are enabled once configured (play) or held (pause)
    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.playing
    }

    fn mask_in(&self, state: StreamState) -> u8 {
        self.phases
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == state)
            .fold(0, |mask, (i, _)| mask | (1 << i))
    }

    fn any_streaming(&self) -> bool {
        self.phases.contains(&StreamState::Streaming)
    }

    /// Channel bound to `acl`, logging unknown links
    fn channel_of(ctx: &RoleContext<'_>, acl: u16) -> Option<usize> {
        let channel = ctx.registry.find_by_peer(acl);
        if channel.is_none() {
            warn!("[GATEWAY] Unknown connection {}", acl);
        }
        channel
    }

    /// Peer link of `channel`, logging unknown channels
    fn peer_of(ctx: &RoleContext<'_>, channel: usize) -> Option<u16> {
        match ctx.registry.channel(channel) {
            Ok(c) if c.peer.is_some() => c.peer,
            _ => {
                warn!("[GATEWAY] Stream event for unbound channel {}", channel);
                None
            }
        }
    }

    /// Resume scanning if a channel still has no headset
    fn rescan(&mut self, ctx: &RoleContext<'_>) -> Transition {
        if !self.started || self.scanning || self.connecting.is_some() {
            return Transition::none();
        }
        if ctx.registry.first_unassigned().is_none() {
            debug!("[GATEWAY] All headsets connected");
            return Transition::none();
        }
        self.scanning = true;
        Transition::action(Action::StartScan(ScanMode::Connectable))
    }

    fn reject(acl: u16) -> Transition {
        Transition::action(Action::Disconnect {
            acl,
            cause: DisconnectCause::RemoteUserTerminated,
        })
        .publish(LeAudioEvent::NoValidConfig)
    }

    fn on_scan_report(&mut self, ctx: &RoleContext<'_>, event: &StackEvent) -> Transition {
        let StackEvent::ScanReport {
            peer,
            adv_type,
            data,
            ..
        } = event
        else {
            return Transition::none();
        };

        if !self.scanning || self.connecting.is_some() {
            return Transition::none();
        }
        if ctx.registry.first_unassigned().is_none() {
            debug!("[GATEWAY] All headsets connected");
            return Transition::none();
        }
        if !matches_peer_name(*adv_type, data, self.peer_name) {
            return Transition::none();
        }

        info!("[GATEWAY] Found {}, connecting", peer.format_hex().as_str());
        self.scanning = false;
        self.connecting = Some(*peer);
        Transition::action(Action::ConnectAcl(*peer))
    }

    fn on_acl_connected(&mut self, ctx: &mut RoleContext<'_>, peer: LeAddress, acl: u16) -> Transition {
        if self.connecting == Some(peer) {
            self.connecting = None;
        }
        if ctx.registry.find_by_peer(acl).is_some() {
            warn!("[GATEWAY] Connection {} already bound", acl);
            return Transition::none();
        }

        let Some(channel) = ctx.registry.first_unassigned() else {
            warn!("[GATEWAY] No free channel for connection {}", acl);
            return Transition::action(Action::Disconnect {
                acl,
                cause: DisconnectCause::RemoteUserTerminated,
            });
        };

        info!("[GATEWAY] Connected {} on channel {}", acl, channel);
        if ctx.registry.assign_peer(channel, acl).is_err()
            || ctx.registry.set_state(channel, ChannelState::Connecting).is_err()
        {
            return Transition::none();
        }
        self.phases[channel] = StreamState::AclConnected;
        Transition::action(Action::SetSecurity { acl })
    }

    fn on_security_changed(
        &mut self,
        ctx: &RoleContext<'_>,
        acl: u16,
        error: Option<u8>,
    ) -> Transition {
        let Some(channel) = Self::channel_of(ctx, acl) else {
            return Transition::none();
        };

        if let Some(err) = error {
            error!("[GATEWAY] Security failed on channel {}: {}", channel, err);
            return Transition::action(Action::Disconnect {
                acl,
                cause: DisconnectCause::AuthenticationFailure,
            });
        }

        self.phases[channel] = StreamState::ServiceDiscovering;
        if self.stream_discovery {
            Transition::action(Action::DiscoverSink { acl })
        } else {
            Transition::action(Action::ExchangeMtu { acl })
        }
    }

    fn on_mtu_exchanged(&mut self, ctx: &mut RoleContext<'_>, acl: u16, success: bool) -> Transition {
        let Some(channel) = Self::channel_of(ctx, acl) else {
            return Transition::none();
        };

        if !success {
            error!("[GATEWAY] MTU exchange failed on channel {}", channel);
            return Transition::action(Action::Disconnect {
                acl,
                cause: DisconnectCause::RemoteUserTerminated,
            });
        }
        if self.stream_discovery {
            debug!("[GATEWAY] MTU exchanged on channel {}", channel);
            return Transition::none();
        }

        self.phases[channel] = StreamState::Connecting;
        Transition::action(Action::ScheduleCisConnect { channel })
    }

    fn on_discovery_complete(
        &mut self,
        ctx: &mut RoleContext<'_>,
        acl: u16,
        location: crate::event::AudioLocation,
    ) -> Transition {
        let Some(channel) = Self::channel_of(ctx, acl) else {
            return Transition::none();
        };

        let Some(target) = location
            .channel()
            .filter(|&target| target < ctx.registry.len())
        else {
            error!("[GATEWAY] Channel location {} not supported", location);
            return Self::reject(acl);
        };

        if target != channel {
            let free = ctx
                .registry
                .channel(target)
                .is_ok_and(|c| c.peer.is_none());
            if !free {
                error!("[GATEWAY] Location {} already taken", location);
                return Self::reject(acl);
            }

            debug!("[GATEWAY] Moving connection {} to channel {}", acl, target);
            let state = ctx.registry.state(channel).unwrap_or_default();
            if ctx.registry.release(channel).is_err()
                || ctx.registry.assign_peer(target, acl).is_err()
                || ctx.registry.set_state(target, state).is_err()
            {
                return Transition::none();
            }
            ctx.retry.cancel(channel);
            self.phases[target] = self.phases[channel];
            self.phases[channel] = StreamState::Idle;
        }

        Transition::action(Action::ConfigureCodec {
            channel: target,
            acl,
        })
    }

    fn on_stream_event(&mut self, ctx: &mut RoleContext<'_>, event: &StackEvent) -> Transition {
        let Some(channel) = event.channel() else {
            return Transition::none();
        };
        let Some(acl) = Self::peer_of(ctx, channel) else {
            return Transition::none();
        };

        match *event {
            StackEvent::CodecConfigured { valid: false, .. } => {
                error!("[GATEWAY] Invalid codec configuration on channel {}", channel);
                Self::reject(acl)
            }
            StackEvent::CodecConfigured { valid: true, .. } => {
                self.phases[channel] = StreamState::CodecConfigured;
                Transition::action(Action::ConfigureQos { channel, acl })
            }
            StackEvent::QosConfigured { .. } => {
                self.phases[channel] = StreamState::QosConfigured;
                if self.playing {
                    Transition::action(Action::EnableStream { channel })
                } else {
                    Transition::none()
                }
            }
            StackEvent::StreamEnabled { .. } => {
                self.phases[channel] = StreamState::Enabled;
                Transition::action(Action::ScheduleStreamStart { channel })
            }
            StackEvent::StreamStarted { .. } => {
                info!("[GATEWAY] Stream started on channel {}", channel);
                self.phases[channel] = StreamState::Streaming;
                // Index checked by peer_of.
                let _ = ctx.registry.set_state(channel, ChannelState::Streaming);
                if self.streaming_announced {
                    Transition::none()
                } else {
                    self.streaming_announced = true;
                    Transition::none().publish(LeAudioEvent::Streaming)
                }
            }
            StackEvent::StreamStopped { .. } | StackEvent::StreamDisabled { .. } => {
                info!("[GATEWAY] Stream stopped on channel {}", channel);
                self.phases[channel] = StreamState::QosConfigured;
                let _ = ctx.pool.clear(channel);
                if ctx.registry.state(channel) == Ok(ChannelState::Streaming) {
                    let _ = ctx.registry.set_state(channel, ChannelState::Connected);
                }
                if self.streaming_announced && !self.any_streaming() {
                    self.streaming_announced = false;
                    Transition::none().publish(LeAudioEvent::NotStreaming)
                } else {
                    Transition::none()
                }
            }
            StackEvent::StreamReleased { .. } => {
                debug!("[GATEWAY] Stream released on channel {}", channel);
                self.phases[channel] = StreamState::AclConnected;
                if self.streaming_announced && !self.any_streaming() {
                    self.streaming_announced = false;
                    Transition::none().publish(LeAudioEvent::NotStreaming)
                } else {
                    Transition::none()
                }
            }
            _ => Transition::none(),
        }
    }

    fn on_acl_disconnected(&mut self, ctx: &mut RoleContext<'_>, acl: u16, reason: u8) -> Transition {
        info!("[GATEWAY] Disconnected {} (reason {:#x})", acl, reason);
        match ctx.registry.find_by_peer(acl) {
            Some(channel) => {
                let _ = ctx.release_channel(channel);
                self.phases[channel] = StreamState::Idle;
            }
            None => {
                debug!("[GATEWAY] Disconnect of unbound connection {}", acl);
            }
        }

        let mut transition = self.rescan(ctx);
        if ctx.registry.connected_count() == 0 && self.link_announced {
            self.link_announced = false;
            self.streaming_announced = false;
            transition = transition.publish(LeAudioEvent::Disconnected);
        }
        transition
    }
}

impl AudioRoleBehavior for UnicastClient {
    fn start(&mut self, _ctx: &mut RoleContext<'_>) -> Result<Transition, TransportError> {
        if !self.started {
            info!("[GATEWAY] Starting, scanning for {}", self.peer_name);
            self.started = true;
            self.playing = self.play_on_connect;
            self.scanning = true;
            return Ok(Transition::action(Action::StartScan(ScanMode::Connectable)));
        }

        if self.playing {
            return Ok(Transition::none());
        }

        info!("[GATEWAY] Play");
        self.playing = true;
        let mask = self.mask_in(StreamState::QosConfigured);
        Ok(if mask == 0 {
            Transition::none()
        } else {
            Transition::action(Action::EnableStreams { mask })
        })
    }

    fn stop(&mut self, _ctx: &mut RoleContext<'_>) -> Result<Transition, TransportError> {
        if !self.started {
            return Err(TransportError::InvalidState);
        }

        info!("[GATEWAY] Pause");
        self.playing = false;
        let mask = if self.stream_discovery {
            self.mask_in(StreamState::Streaming)
        } else {
            0
        };
        Ok(if mask == 0 {
            Transition::none()
        } else {
            Transition::action(Action::DisableStreams { mask })
        })
    }

    fn on_connected(&mut self, ctx: &mut RoleContext<'_>, channel: usize) -> Transition {
        if !ctx.registry.channel(channel).is_ok_and(|c| c.peer.is_some()) {
            warn!("[GATEWAY] CIS connected on unbound channel {}", channel);
            return Transition::none();
        }
        if !matches!(
            self.phases[channel],
            StreamState::Connecting | StreamState::Enabled | StreamState::Streaming
        ) {
            warn!(
                "[GATEWAY] CIS connected on channel {} in state {}",
                channel, self.phases[channel]
            );
            return Transition::none();
        }

        info!("[GATEWAY] CIS connected on channel {}", channel);
        let (registry_state, phase) = if self.stream_discovery {
            (ChannelState::Connected, StreamState::Enabled)
        } else {
            (ChannelState::Streaming, StreamState::Streaming)
        };
        let _ = ctx.registry.set_state(channel, registry_state);
        if self.phases[channel] != StreamState::Streaming {
            self.phases[channel] = phase;
        }

        let mut transition = self.rescan(ctx);
        if ctx.registry.connected_count() == 1 {
            if !self.link_announced {
                self.link_announced = true;
                transition = transition
                    .publish(LeAudioEvent::Connected)
                    .publish(LeAudioEvent::LinkReady);
            }
            if !self.stream_discovery && !self.streaming_announced {
                self.streaming_announced = true;
                transition = transition.publish(LeAudioEvent::Streaming);
            }
        } else {
            // Let in-flight SDUs drain so both headsets start on the same frame.
            ctx.pool.request_flush();
        }
        transition
    }

    fn on_disconnected(
        &mut self,
        ctx: &mut RoleContext<'_>,
        channel: usize,
        reason: u8,
    ) -> Transition {
        if ctx.registry.channel(channel).is_err() {
            warn!("[GATEWAY] CIS disconnected on unknown channel {}", channel);
            return Transition::none();
        }

        info!("[GATEWAY] CIS {} disconnected, reason {:#x}", channel, reason);
        let _ = ctx.pool.clear(channel);
        ctx.retry.cancel(channel);
        ctx.timing.invalidate();
        let _ = ctx.registry.set_state(channel, ChannelState::Idle);
        if self.phases[channel] != StreamState::Idle {
            self.phases[channel] = if self.stream_discovery {
                StreamState::QosConfigured
            } else {
                StreamState::AclConnected
            };
        }

        let mut transition = Transition::none();
        if self.streaming_announced && !self.any_streaming() {
            self.streaming_announced = false;
            transition = transition.publish(LeAudioEvent::NotStreaming);
        }
        if ctx.registry.connected_count() == 0 && self.link_announced {
            self.link_announced = false;
            transition = transition.publish(LeAudioEvent::Disconnected);
        }
        transition
    }

    fn on_event(&mut self, ctx: &mut RoleContext<'_>, event: &StackEvent) -> Transition {
        match *event {
            StackEvent::ScanReport { .. } => self.on_scan_report(ctx, event),
            StackEvent::AclConnectFailed { peer, status } => {
                warn!("[GATEWAY] Connection to {} failed: {:#x}", peer.format_hex().as_str(), status);
                self.connecting = None;
                self.rescan(ctx)
            }
            StackEvent::AclConnected { peer, acl } => self.on_acl_connected(ctx, peer, acl),
            StackEvent::AclDisconnected { acl, reason } => self.on_acl_disconnected(ctx, acl, reason),
            StackEvent::SecurityChanged { acl, error } => self.on_security_changed(ctx, acl, error),
            StackEvent::MtuExchanged { acl, success } => self.on_mtu_exchanged(ctx, acl, success),
            StackEvent::DiscoveryComplete { acl, location } => {
                self.on_discovery_complete(ctx, acl, location)
            }
            StackEvent::CodecConfigured { .. }
            | StackEvent::QosConfigured { .. }
            | StackEvent::StreamEnabled { .. }
            | StackEvent::StreamStarted { .. }
            | StackEvent::StreamStopped { .. }
            | StackEvent::StreamDisabled { .. }
            | StackEvent::StreamReleased { .. } => self.on_stream_event(ctx, event),
            _ => {
                warn!("[GATEWAY] Unexpected event {}", event);
                Transition::none()
            }
        }
    }

    fn state(&self) -> StreamState {
        if !self.started {
            return StreamState::Idle;
        }
        if self.any_streaming() {
            return StreamState::Streaming;
        }
        if self.connecting.is_some() {
            return StreamState::AclConnecting;
        }
        if self.scanning {
            return StreamState::Scanning;
        }
        self.phases
            .iter()
            .copied()
            .find(|s| *s != StreamState::Idle)
            .unwrap_or(StreamState::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adv::AdvertisingType;
    use crate::event::AudioLocation;
    use crate::role::tests::Harness;
    use crate::{Direction, TransportKind};

    const LEFT: LeAddress = LeAddress::random([1, 0, 0, 0, 0, 0xC0]);
    const RIGHT: LeAddress = LeAddress::random([2, 0, 0, 0, 0, 0xC0]);

    fn name_report(peer: LeAddress, name: &str) -> StackEvent {
        let mut payload = [0u8; 31];
        payload[0] = name.len() as u8 + 1;
        payload[1] = crate::constants::AD_TYPE_NAME_COMPLETE;
        payload[2..2 + name.len()].copy_from_slice(name.as_bytes());
        StackEvent::scan_report(
            peer,
            AdvertisingType::ConnectableUndirected,
            0,
            0,
            &payload[..2 + name.len()],
        )
    }

    fn setup(options: TransportOptions) -> (UnicastClient, Harness) {
        let client = UnicastClient::new(&options);
        let harness = Harness::new(options.channel_count, TransportKind::Cis, Direction::Tx);
        (client, harness)
    }

    /// Run a headset through the direct flow up to the CIS connect request
    fn connect(client: &mut UnicastClient, h: &mut Harness, peer: LeAddress, acl: u16) -> usize {
        let t = client.on_event(&mut h.ctx(), &name_report(peer, crate::constants::DEFAULT_PEER_NAME));
        assert_eq!(t.action, Some(Action::ConnectAcl(peer)));
        let t = client.on_event(&mut h.ctx(), &StackEvent::AclConnected { peer, acl });
        assert_eq!(t.action, Some(Action::SetSecurity { acl }));
        let t = client.on_event(&mut h.ctx(), &StackEvent::SecurityChanged { acl, error: None });
        assert_eq!(t.action, Some(Action::ExchangeMtu { acl }));
        let t = client.on_event(&mut h.ctx(), &StackEvent::MtuExchanged { acl, success: true });
        let Some(Action::ScheduleCisConnect { channel }) = t.action else {
            panic!("expected CIS connect, got {:?}", t.action);
        };
        channel
    }

    #[test]
    fn test_start_scans() {
        let (mut client, mut h) = setup(TransportOptions::gateway_cis());
        assert_eq!(client.state(), StreamState::Idle);
        let t = client.start(&mut h.ctx()).unwrap();
        assert_eq!(t.action, Some(Action::StartScan(ScanMode::Connectable)));
        assert_eq!(client.state(), StreamState::Scanning);
    }

    #[test]
    fn test_stop_before_start_is_invalid() {
        let (mut client, mut h) = setup(TransportOptions::gateway_cis());
        assert_eq!(client.stop(&mut h.ctx()), Err(TransportError::InvalidState));
    }

    #[test]
    fn test_ignores_other_names() {
        let (mut client, mut h) = setup(TransportOptions::gateway_cis());
        client.start(&mut h.ctx()).unwrap();
        let t = client.on_event(&mut h.ctx(), &name_report(LEFT, "SOMETHING_ELSE"));
        assert!(t.is_empty());
        assert_eq!(client.state(), StreamState::Scanning);
    }

    #[test]
    fn test_first_cis_announces_once() {
        let (mut client, mut h) = setup(TransportOptions::gateway_cis());
        client.start(&mut h.ctx()).unwrap();
        let channel = connect(&mut client, &mut h, LEFT, 0x40);
        assert_eq!(channel, 0);

        let t = client.on_connected(&mut h.ctx(), channel);
        assert_eq!(
            t.events.as_slice(),
            &[
                LeAudioEvent::Connected,
                LeAudioEvent::LinkReady,
                LeAudioEvent::Streaming
            ]
        );
        // Right channel still free, scan again
        assert_eq!(t.action, Some(Action::StartScan(ScanMode::Connectable)));
        assert_eq!(h.registry.state(0), Ok(ChannelState::Streaming));
        assert_eq!(client.state(), StreamState::Streaming);

        // Second CIS requests a flush and publishes nothing
        let channel = connect(&mut client, &mut h, RIGHT, 0x41);
        assert_eq!(channel, 1);
        let t = client.on_connected(&mut h.ctx(), channel);
        assert!(t.events.is_empty());
        assert_eq!(t.action, None);
        assert!(h.pool.flush_pending());
        assert!(h.registry.all_channels_connected());
    }

    #[test]
    fn test_security_failure_disconnects() {
        let (mut client, mut h) = setup(TransportOptions::gateway_cis());
        client.start(&mut h.ctx()).unwrap();
        client.on_event(&mut h.ctx(), &name_report(LEFT, crate::constants::DEFAULT_PEER_NAME));
        client.on_event(&mut h.ctx(), &StackEvent::AclConnected { peer: LEFT, acl: 0x40 });
        let t = client.on_event(
            &mut h.ctx(),
            &StackEvent::SecurityChanged {
                acl: 0x40,
                error: Some(0x05),
            },
        );
        assert_eq!(
            t.action,
            Some(Action::Disconnect {
                acl: 0x40,
                cause: DisconnectCause::AuthenticationFailure
            })
        );
    }

    #[test]
    fn test_acl_connect_failure_rescans() {
        let (mut client, mut h) = setup(TransportOptions::gateway_cis());
        client.start(&mut h.ctx()).unwrap();
        client.on_event(&mut h.ctx(), &name_report(LEFT, crate::constants::DEFAULT_PEER_NAME));
        assert_eq!(client.state(), StreamState::AclConnecting);
        let t = client.on_event(
            &mut h.ctx(),
            &StackEvent::AclConnectFailed {
                peer: LEFT,
                status: 0x3E,
            },
        );
        assert_eq!(t.action, Some(Action::StartScan(ScanMode::Connectable)));
        assert_eq!(client.state(), StreamState::Scanning);
    }

    #[test]
    fn test_disconnect_releases_and_rescans() {
        let (mut client, mut h) = setup(TransportOptions::gateway_cis().with_channel_count(1));
        client.start(&mut h.ctx()).unwrap();
        let channel = connect(&mut client, &mut h, LEFT, 0x40);
        client.on_connected(&mut h.ctx(), channel);
        h.pool.try_reserve(0).unwrap();

        let t = client.on_disconnected(&mut h.ctx(), 0, 0x13);
        assert_eq!(
            t.events.as_slice(),
            &[LeAudioEvent::NotStreaming, LeAudioEvent::Disconnected]
        );
        assert_eq!(h.pool.in_flight(0), Ok(0));

        let t = client.on_event(
            &mut h.ctx(),
            &StackEvent::AclDisconnected {
                acl: 0x40,
                reason: 0x13,
            },
        );
        assert_eq!(t.action, Some(Action::StartScan(ScanMode::Connectable)));
        assert!(t.events.is_empty());
        assert_eq!(h.registry.channel(0).unwrap().peer, None);
        assert_eq!(client.channel_state(0), Some(StreamState::Idle));
    }

    #[test]
    fn test_unknown_connection_is_ignored() {
        let (mut client, mut h) = setup(TransportOptions::gateway_cis());
        client.start(&mut h.ctx()).unwrap();
        let t = client.on_event(
            &mut h.ctx(),
            &StackEvent::SecurityChanged {
                acl: 0x99,
                error: None,
            },
        );
        assert!(t.is_empty());
        let t = client.on_connected(&mut h.ctx(), 5);
        assert!(t.is_empty());
    }

    #[test]
    fn test_stray_cis_connect_is_ignored() {
        let (mut client, mut h) = setup(TransportOptions::gateway_cis());
        client.start(&mut h.ctx()).unwrap();

        // No headset on the channel
        let t = client.on_connected(&mut h.ctx(), 1);
        assert!(t.is_empty());
        assert_eq!(h.registry.state(1), Ok(ChannelState::Idle));

        // Headset bound but no CIS requested yet
        client.on_event(&mut h.ctx(), &name_report(LEFT, crate::constants::DEFAULT_PEER_NAME));
        client.on_event(&mut h.ctx(), &StackEvent::AclConnected { peer: LEFT, acl: 0x40 });
        let t = client.on_connected(&mut h.ctx(), 0);
        assert!(t.is_empty());
        assert_eq!(h.registry.state(0), Ok(ChannelState::Connecting));
        assert_eq!(client.channel_state(0), Some(StreamState::AclConnected));
    }

    #[test]
    fn test_stream_discovery_flow() {
        let (mut client, mut h) =
            setup(TransportOptions::gateway_cis().with_stream_discovery(true));
        client.start(&mut h.ctx()).unwrap();
        client.on_event(&mut h.ctx(), &name_report(RIGHT, crate::constants::DEFAULT_PEER_NAME));
        client.on_event(&mut h.ctx(), &StackEvent::AclConnected { peer: RIGHT, acl: 0x41 });
        let t = client.on_event(
            &mut h.ctx(),
            &StackEvent::SecurityChanged {
                acl: 0x41,
                error: None,
            },
        );
        assert_eq!(t.action, Some(Action::DiscoverSink { acl: 0x41 }));

        // Headset reports front right, channel moves from 0 to 1
        let t = client.on_event(
            &mut h.ctx(),
            &StackEvent::DiscoveryComplete {
                acl: 0x41,
                location: AudioLocation::FrontRight,
            },
        );
        assert_eq!(
            t.action,
            Some(Action::ConfigureCodec {
                channel: 1,
                acl: 0x41
            })
        );
        assert_eq!(h.registry.find_by_peer(0x41), Some(1));
        assert_eq!(h.registry.channel(0).unwrap().peer, None);

        let t = client.on_event(
            &mut h.ctx(),
            &StackEvent::CodecConfigured {
                channel: 1,
                valid: true,
            },
        );
        assert_eq!(
            t.action,
            Some(Action::ConfigureQos {
                channel: 1,
                acl: 0x41
            })
        );
        let t = client.on_event(&mut h.ctx(), &StackEvent::QosConfigured { channel: 1 });
        assert_eq!(t.action, Some(Action::EnableStream { channel: 1 }));
        let t = client.on_event(&mut h.ctx(), &StackEvent::StreamEnabled { channel: 1 });
        assert_eq!(t.action, Some(Action::ScheduleStreamStart { channel: 1 }));

        let t = client.on_connected(&mut h.ctx(), 1);
        assert_eq!(
            t.events.as_slice(),
            &[LeAudioEvent::Connected, LeAudioEvent::LinkReady]
        );
        let t = client.on_event(&mut h.ctx(), &StackEvent::StreamStarted { channel: 1 });
        assert_eq!(t.events.as_slice(), &[LeAudioEvent::Streaming]);
        assert_eq!(client.state(), StreamState::Streaming);

        // Pause and resume
        let t = client.stop(&mut h.ctx()).unwrap();
        assert_eq!(t.action, Some(Action::DisableStreams { mask: 0b10 }));
        let t = client.on_event(
            &mut h.ctx(),
            &StackEvent::StreamStopped {
                channel: 1,
                reason: 0,
            },
        );
        assert_eq!(t.events.as_slice(), &[LeAudioEvent::NotStreaming]);
        let t = client.start(&mut h.ctx()).unwrap();
        assert_eq!(t.action, Some(Action::EnableStreams { mask: 0b10 }));
    }

    #[test]
    fn test_paused_gateway_holds_configured_stream() {
        let (mut client, mut h) =
            setup(TransportOptions::gateway_cis().with_stream_discovery(true));
        client.start(&mut h.ctx()).unwrap();
        client.stop(&mut h.ctx()).unwrap();
        assert!(!client.is_playing());

        client.on_event(&mut h.ctx(), &name_report(LEFT, crate::constants::DEFAULT_PEER_NAME));
        client.on_event(&mut h.ctx(), &StackEvent::AclConnected { peer: LEFT, acl: 0x40 });
        client.on_event(
            &mut h.ctx(),
            &StackEvent::CodecConfigured {
                channel: 0,
                valid: true,
            },
        );
        let t = client.on_event(&mut h.ctx(), &StackEvent::QosConfigured { channel: 0 });
        assert_eq!(t.action, None);
        assert_eq!(client.channel_state(0), Some(StreamState::QosConfigured));
    }

    #[test]
    fn test_unsupported_location_rejected() {
        let (mut client, mut h) =
            setup(TransportOptions::gateway_cis().with_stream_discovery(true));
        client.start(&mut h.ctx()).unwrap();
        client.on_event(&mut h.ctx(), &name_report(LEFT, crate::constants::DEFAULT_PEER_NAME));
        client.on_event(&mut h.ctx(), &StackEvent::AclConnected { peer: LEFT, acl: 0x40 });
        let t = client.on_event(
            &mut h.ctx(),
            &StackEvent::DiscoveryComplete {
                acl: 0x40,
                location: AudioLocation::Unsupported,
            },
        );
        assert_eq!(
            t.action,
            Some(Action::Disconnect {
                acl: 0x40,
                cause: DisconnectCause::RemoteUserTerminated
            })
        );
        assert_eq!(t.events.as_slice(), &[LeAudioEvent::NoValidConfig]);
    }

    #[test]
    fn test_invalid_codec_config_rejected() {
        let (mut client, mut h) =
            setup(TransportOptions::gateway_cis().with_stream_discovery(true));
        client.start(&mut h.ctx()).unwrap();
        client.on_event(&mut h.ctx(), &name_report(LEFT, crate::constants::DEFAULT_PEER_NAME));
        client.on_event(&mut h.ctx(), &StackEvent::AclConnected { peer: LEFT, acl: 0x40 });
        let t = client.on_event(
            &mut h.ctx(),
            &StackEvent::CodecConfigured {
                channel: 0,
                valid: false,
            },
        );
        assert_eq!(t.events.as_slice(), &[LeAudioEvent::NoValidConfig]);
        assert!(matches!(t.action, Some(Action::Disconnect { acl: 0x40, .. })));
    }

    #[test]
    fn test_every_callback_yields_at_most_one_action() {
        let (mut client, mut h) = setup(TransportOptions::gateway_cis());
        client.start(&mut h.ctx()).unwrap();
        let events = [
            name_report(LEFT, crate::constants::DEFAULT_PEER_NAME),
            StackEvent::AclConnected {
                peer: LEFT,
                acl: 0x40,
            },
            StackEvent::SecurityChanged {
                acl: 0x40,
                error: None,
            },
            StackEvent::MtuExchanged {
                acl: 0x40,
                success: true,
            },
            StackEvent::AclDisconnected {
                acl: 0x40,
                reason: 0x08,
            },
        ];
        for event in &events {
            // Option<Action> holds one action at most; check the state stays coherent
            let t = client.on_event(&mut h.ctx(), event);
            assert!(t.events.len() <= crate::constants::MAX_EVENTS_PER_TRANSITION);
        }
        assert_eq!(client.state(), StreamState::Scanning);
        assert_eq!(h.registry.connected_count(), 0);
    }
}
