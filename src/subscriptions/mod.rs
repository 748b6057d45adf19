//! Streaming subscriptions.
//!
//! A subscription is created in `Subscribing` when a session accepts a
//! [`SubscriptionList`] entry and is then driven by status messages from the
//! server and by explicit `unsubscribe`/`resubscribe` calls:
//!
//! ```text
//! Subscribing ──started──► Subscribed ──unsubscribe/resubscribe──► PendingCancellation
//!      │                       ▲                                     │        │
//!      │                       └────────resubscription confirmed─────┘        │
//!      └──failure──► Unsubscribed                    cancellation confirmed ──► Cancelled
//! ```
//!
//! Unless an unsubscribe is pending, a server-side termination moves the
//! subscription to `Unsubscribed`.
//!
//! # Example
//!
//! ```ignore
//! let mut list = SubscriptionList::new();
//! let ibm = list.add("//blp/mktdata/IBM US Equity?fields=BID,ASK", None);
//! let errors = session.subscribe(
//!     &list,
//!     None,
//!     "",
//!     SubscriptionPreprocessMode::ReturnIndividualErrors,
//! )?;
//! ```

mod manager;
mod types;

pub use manager::{PreprocessPurpose, Preprocessed, SubscriptionManager, SubscriptionUpdate};
pub use types::{
    PreprocessErrorCode, SubscriptionEntry, SubscriptionList, SubscriptionPreprocessError,
    SubscriptionPreprocessMode, SubscriptionState, Topic,
};
