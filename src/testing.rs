//! Recording LE host stack for unit tests

extern crate std;

use core::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::vec::Vec;

use bt_hci::param::{ConnHandle, DisconnectReason};

use crate::constants::{BROADCAST_CODE_LENGTH, HCI_ERR_REMOTE_USER_TERM_CONN};
use crate::{BackendError, IsoBackend, LeAddress, ScanMode, TimingSample};

/// Reason code recorded for an authentication failure disconnect
pub(crate) const AUTH_FAILURE: u8 = 0x05;

/// One call made on the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Send { channel: usize, data: Vec<u8> },
    Delay(u32),
    ReadAnchor(usize),
    IsoConnect { channel: usize, acl: u16 },
    AclCreate(LeAddress),
    AclDisconnect { acl: u16, reason: u8 },
    SetSecurity(u16),
    ExchangeMtu(u16),
    DiscoverSink(u16),
    StreamConfig { channel: usize, acl: u16 },
    StreamQos { channel: usize, acl: u16 },
    StreamEnable(usize),
    StreamStart(usize),
    StreamDisable(usize),
    ScanStart(ScanMode),
    ScanStop,
    AdvStart,
    AdvStop,
    BroadcastSourceCreate,
    ExtAdvStart,
    PerAdvStart,
    BigCreate(usize),
    BigTerminate,
    BigSync {
        bis_bitfield: u32,
        broadcast_code: Option<[u8; BROADCAST_CODE_LENGTH]>,
    },
    PaSyncCreate { peer: LeAddress, sid: u8, timeout_10ms: u16 },
    PaSyncDelete,
}

/// Backend that records every call and returns scripted results
#[derive(Debug, Default)]
pub(crate) struct MockBackend {
    pub calls: RefCell<Vec<Call>>,
    pub now_ms: Cell<u64>,
    pub now_us: Cell<u32>,
    /// Results of successive anchor reads, `NotEstablished` once exhausted
    pub anchors: RefCell<VecDeque<Result<TimingSample, BackendError>>>,
    /// Results of successive CIS connects, `Ok` once exhausted
    pub iso_connect_results: RefCell<VecDeque<Result<(), BackendError>>>,
    /// Results of successive stream starts, `Ok` once exhausted
    pub stream_start_results: RefCell<VecDeque<Result<(), BackendError>>>,
    pub send_result: Cell<Option<BackendError>>,
    pub acl_create_result: Cell<Option<BackendError>>,
    pub pa_sync_create_result: Cell<Option<BackendError>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance_ms(&self, ms: u64) {
        self.now_ms.set(self.now_ms.get() + ms);
        self.now_us
            .set(self.now_us.get().wrapping_add((ms * 1000) as u32));
    }

    pub fn take_calls(&self) -> Vec<Call> {
        self.calls.take()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.borrow().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: Call) {
        self.calls.borrow_mut().push(call);
    }

    fn scripted(result: Option<BackendError>) -> Result<(), BackendError> {
        result.map_or(Ok(()), Err)
    }
}

impl IsoBackend for MockBackend {
    fn now_ms(&self) -> u64 {
        self.now_ms.get()
    }

    fn now_us(&self) -> u32 {
        self.now_us.get()
    }

    fn delay_us(&self, us: u32) {
        self.record(Call::Delay(us));
    }

    fn iso_send(&self, channel: usize, payload: &[u8]) -> Result<(), BackendError> {
        self.record(Call::Send {
            channel,
            data: payload.to_vec(),
        });
        Self::scripted(self.send_result.get())
    }

    fn read_iso_tx_anchor(&self, channel: usize) -> Result<TimingSample, BackendError> {
        self.record(Call::ReadAnchor(channel));
        self.anchors
            .borrow_mut()
            .pop_front()
            .unwrap_or(Err(BackendError::NotEstablished))
    }

    fn iso_connect(&self, channel: usize, acl: ConnHandle) -> Result<(), BackendError> {
        self.record(Call::IsoConnect {
            channel,
            acl: acl.raw(),
        });
        self.iso_connect_results
            .borrow_mut()
            .pop_front()
            .unwrap_or(Ok(()))
    }

    fn acl_create(&self, peer: LeAddress) -> Result<(), BackendError> {
        self.record(Call::AclCreate(peer));
        Self::scripted(self.acl_create_result.get())
    }

    fn acl_disconnect(&self, acl: ConnHandle, reason: DisconnectReason) -> Result<(), BackendError> {
        let reason = if matches!(reason, DisconnectReason::AuthenticationFailure) {
            AUTH_FAILURE
        } else {
            HCI_ERR_REMOTE_USER_TERM_CONN
        };
        self.record(Call::AclDisconnect {
            acl: acl.raw(),
            reason,
        });
        Ok(())
    }

    fn set_security(&self, acl: ConnHandle) -> Result<(), BackendError> {
        self.record(Call::SetSecurity(acl.raw()));
        Ok(())
    }

    fn exchange_mtu(&self, acl: ConnHandle) -> Result<(), BackendError> {
        self.record(Call::ExchangeMtu(acl.raw()));
        Ok(())
    }

    fn discover_sink(&self, acl: ConnHandle) -> Result<(), BackendError> {
        self.record(Call::DiscoverSink(acl.raw()));
        Ok(())
    }

    fn stream_config(&self, channel: usize, acl: ConnHandle) -> Result<(), BackendError> {
        self.record(Call::StreamConfig {
            channel,
            acl: acl.raw(),
        });
        Ok(())
    }

    fn stream_qos(&self, channel: usize, acl: ConnHandle) -> Result<(), BackendError> {
        self.record(Call::StreamQos {
            channel,
            acl: acl.raw(),
        });
        Ok(())
    }

    fn stream_enable(&self, channel: usize) -> Result<(), BackendError> {
        self.record(Call::StreamEnable(channel));
        Ok(())
    }

    fn stream_start(&self, channel: usize) -> Result<(), BackendError> {
        self.record(Call::StreamStart(channel));
        self.stream_start_results
            .borrow_mut()
            .pop_front()
            .unwrap_or(Ok(()))
    }

    fn stream_disable(&self, channel: usize) -> Result<(), BackendError> {
        self.record(Call::StreamDisable(channel));
        Ok(())
    }

    fn scan_start(&self, mode: ScanMode) -> Result<(), BackendError> {
        self.record(Call::ScanStart(mode));
        Ok(())
    }

    fn scan_stop(&self) -> Result<(), BackendError> {
        self.record(Call::ScanStop);
        Ok(())
    }

    fn adv_start(&self) -> Result<(), BackendError> {
        self.record(Call::AdvStart);
        Ok(())
    }

    fn adv_stop(&self) -> Result<(), BackendError> {
        self.record(Call::AdvStop);
        Ok(())
    }

    fn broadcast_source_create(&self) -> Result<(), BackendError> {
        self.record(Call::BroadcastSourceCreate);
        Ok(())
    }

    fn ext_adv_start(&self) -> Result<(), BackendError> {
        self.record(Call::ExtAdvStart);
        Ok(())
    }

    fn per_adv_start(&self) -> Result<(), BackendError> {
        self.record(Call::PerAdvStart);
        Ok(())
    }

    fn big_create(&self, num_bis: usize) -> Result<(), BackendError> {
        self.record(Call::BigCreate(num_bis));
        Ok(())
    }

    fn big_terminate(&self) -> Result<(), BackendError> {
        self.record(Call::BigTerminate);
        Ok(())
    }

    fn big_sync(
        &self,
        bis_bitfield: u32,
        broadcast_code: Option<&[u8; BROADCAST_CODE_LENGTH]>,
    ) -> Result<(), BackendError> {
        self.record(Call::BigSync {
            bis_bitfield,
            broadcast_code: broadcast_code.copied(),
        });
        Ok(())
    }

    fn pa_sync_create(
        &self,
        peer: LeAddress,
        sid: u8,
        timeout_10ms: u16,
    ) -> Result<(), BackendError> {
        self.record(Call::PaSyncCreate {
            peer,
            sid,
            timeout_10ms,
        });
        Self::scripted(self.pa_sync_create_result.get())
    }

    fn pa_sync_delete(&self) -> Result<(), BackendError> {
        self.record(Call::PaSyncDelete);
        Ok(())
    }
}
