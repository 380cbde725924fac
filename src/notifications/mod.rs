//! Outbound messaging: chat transports, subscriber routing and event delivery.

pub mod alerts;
pub mod dispatcher;
pub mod subscribers;
pub mod telegram;
pub mod transport;

pub use alerts::{AlertSink, LogAlertSink, TransportAlertSink};
pub use dispatcher::{DispatchReport, DispatchSettings, NotificationDispatcher};
pub use subscribers::SubscriberRegistry;
pub use telegram::TelegramClient;
pub use transport::{ConsoleTransport, MessageTransport, OutboundMessage, SentMessage, TransportError};
