pub mod db;
pub mod event;
pub mod ticket;
pub mod zendesk;
pub mod zendesk_api;
