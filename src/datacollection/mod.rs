//! Worker-side data collection
//!
//! [`DataCollectionRequestHandler`] serves the session channel from the
//! controller. Test case events travel on a second channel served by a
//! [`TestCaseEventsHandler`].

pub mod manager;
pub mod request_handler;
pub mod test_case_events;

pub use manager::DataCollectionManager;
pub use request_handler::{DataCollectionRequestHandler, HandlerState};
pub use test_case_events::{DataCollectionTestCaseEventHandler, TestCaseEventsHandler};
