//! The bounded, non-blocking state-transition event stream. A consumer
//! task drains it and logs; when full, new events are dropped rather
//! than applying backpressure to the ingest path.

use modelmesh_types::EndpointState;

pub const EVENT_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct StateTransitionEvent {
    pub id: uuid::Uuid,
    pub endpoint: String,
    pub from: EndpointState,
    pub to: EndpointState,
    pub at: i64,
}
