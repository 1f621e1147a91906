//! Channel adapters, personalization, and the delivery dispatcher.
//!
//! Adapters: one per outreach channel (email, SMS, social), behind the
//! `ChannelAdapter` trait so real providers can be swapped in.
//! Dispatcher: renders a due step for a prospect and hands it to the adapter,
//! producing exactly one terminal `DeliveryEvent` per attempt.

pub mod adapter;
pub mod dispatcher;
pub mod email;
pub mod personalization;
pub mod sms;
pub mod social;

pub use adapter::{AdapterError, AdapterRegistry, ChannelAdapter, ProviderReceipt, ScriptedAdapter};
pub use dispatcher::{DeliveryDispatcher, DispatchReport, DispatchStatus};
pub use email::EmailAdapter;
pub use personalization::{RenderedMessage, TemplateRenderer};
pub use sms::SmsAdapter;
pub use social::SocialAdapter;
