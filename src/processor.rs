//! Processor Tasks - stack event, API request and housekeeping processing
//!
//! The processor owns the only mutable access to the [`StreamTransport`]. Three
//! loops share it through an async mutex and run concurrently:
//!
//! * **Stack Event Processor**: feeds callbacks pushed with [`crate::api::notify`]
//!   to the state machine and executes the resulting actions
//! * **API Request Processor**: handles start / stop / state requests from the
//!   application and answers them
//! * **Housekeeping**: sleeps until the next retry, sync deadline or statistics
//!   report is due and runs it
//!
//! Lifecycle events produced by any of them are published for
//! [`crate::api::next_event`].
//!
//! # Usage
//!
//! ```rust,no_run
//! use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
//! use embassy_sync::mutex::Mutex;
//! use isotrans::{StreamTransport, TransportOptions, processor};
//!
//! # async fn example<B: isotrans::IsoBackend>(backend: B) -> Result<(), isotrans::TransportError> {
//! let transport = StreamTransport::new(TransportOptions::gateway_cis(), backend)?;
//! let transport = Mutex::<CriticalSectionRawMutex, _>::new(transport);
//!
//! // In your Embassy task
//! processor::run(&transport).await;
//! # Ok(())
//! # }
//! ```
//!
//! The audio pipeline locks the same mutex for [`StreamTransport::send`], so a
//! send waits while a loop holds the lock for a state machine step and its
//! backend calls. The budgets themselves are atomic; the lock is only needed to
//! reach the transport.

use embassy_futures::select::{select, select3};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::Timer;
use heapless::Vec;

use crate::constants::{IDLE_POLL_MS, QUEUE_DEPTH};
use crate::log::{debug, error, info, warn};
use crate::transport::PollOutcome;
use crate::{
    IsoBackend, LE_AUDIO_EVENT_CHANNEL, LeAudioEvent, REQUEST_CHANNEL, RESPONSE_CHANNEL, Request,
    Response, STACK_EVENT_CHANNEL, StreamTransport, Transition,
};

/// Transport shared between the processor loops and the application
pub type SharedTransport<B> = Mutex<CriticalSectionRawMutex, StreamTransport<B>>;

/// Raised whenever a deadline may have moved earlier
static WAKE: Signal<CriticalSectionRawMutex, ()> = Signal::new();

/// Events collected while the transport is locked, published after unlocking
type Events = Vec<LeAudioEvent, QUEUE_DEPTH>;

fn collect(events: &mut Events, transition: Transition) {
    for event in transition.events {
        if events.push(event).is_err() {
            warn!("[PROCESSOR] Event {} dropped, too many in one step", event);
        }
    }
}

fn collect_poll(events: &mut Events, outcome: PollOutcome) {
    for event in outcome.events {
        if events.push(event).is_err() {
            warn!("[PROCESSOR] Event {} dropped, too many in one step", event);
        }
    }
    for e in outcome.errors {
        error!("[PROCESSOR] {}", e);
    }
}

fn publish(events: Events) {
    for event in events {
        debug!("[PROCESSOR] Publishing {}", event);
        if LE_AUDIO_EVENT_CHANNEL.try_send(event).is_err() {
            warn!("[PROCESSOR] Event queue full, {} dropped", event);
        }
    }
}

async fn stack_event_processor<B: IsoBackend>(transport: &SharedTransport<B>) -> ! {
    let receiver = STACK_EVENT_CHANNEL.receiver();

    loop {
        let event = receiver.receive().await;
        debug!("[PROCESSOR] Stack event: {}", event);

        let mut events = Events::new();
        {
            let mut transport = transport.lock().await;
            let transition = transport.handle_event(&event);
            collect(&mut events, transition);
            let outcome = transport.poll();
            collect_poll(&mut events, outcome);
        }
        WAKE.signal(());
        publish(events);
    }
}

/// Handle one API request, collecting the events it produces
fn process_api_request<B: IsoBackend>(
    transport: &mut StreamTransport<B>,
    request: Request,
    events: &mut Events,
) -> Response {
    let result = match request {
        Request::Start => transport.start().map(|t| {
            collect(events, t);
            Response::Started
        }),
        Request::Stop => transport.stop().map(|t| {
            collect(events, t);
            Response::Stopped
        }),
        Request::GetState => Ok(Response::State(transport.state())),
        Request::TakeRxStats => Ok(Response::RxStats(transport.take_rx_stats())),
        Request::SetBroadcastCode(code) => transport.set_broadcast_code(code).map(|t| {
            collect(events, t);
            Response::BroadcastCodeSet
        }),
    };
    result.unwrap_or_else(Response::Error)
}

async fn api_request_processor<B: IsoBackend>(transport: &SharedTransport<B>) -> ! {
    let api_receiver = REQUEST_CHANNEL.receiver();
    let api_sender = RESPONSE_CHANNEL.sender();

    loop {
        let api_request = api_receiver.receive().await;
        debug!("[PROCESSOR] API request: {}", request_name(&api_request));

        let mut events = Events::new();
        let response = {
            let mut transport = transport.lock().await;
            process_api_request(&mut transport, api_request, &mut events)
        };
        if let Response::Error(e) = response {
            warn!("[PROCESSOR] API request failed: {}", e);
        }
        WAKE.signal(());
        publish(events);
        api_sender.send(response).await;
    }
}

async fn housekeeping<B: IsoBackend>(transport: &SharedTransport<B>) -> ! {
    loop {
        let wait_ms = {
            let transport = transport.lock().await;
            let now_ms = transport.now_ms();
            transport
                .next_deadline()
                .map_or(IDLE_POLL_MS, |deadline| deadline.saturating_sub(now_ms))
                .min(IDLE_POLL_MS)
        };
        if wait_ms > 0 {
            select(Timer::after_millis(wait_ms), WAKE.wait()).await;
        }

        let mut events = Events::new();
        {
            let mut transport = transport.lock().await;
            let outcome = transport.poll();
            collect_poll(&mut events, outcome);
        }
        publish(events);
    }
}

/// Request name for logging, keeping the broadcast code out of the log
fn request_name(request: &Request) -> &'static str {
    match request {
        Request::Start => "Start",
        Request::Stop => "Stop",
        Request::GetState => "GetState",
        Request::TakeRxStats => "TakeRxStats",
        Request::SetBroadcastCode(_) => "SetBroadcastCode",
    }
}

/// Run the transport processor tasks
///
/// Never returns; spawn it as its own Embassy task or select it against the
/// rest of the application.
pub async fn run<B: IsoBackend>(transport: &SharedTransport<B>) {
    info!("[PROCESSOR] Running");
    select3(
        stack_event_processor(transport),
        api_request_processor(transport),
        housekeeping(transport),
    )
    .await;
}
