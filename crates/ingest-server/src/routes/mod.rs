pub mod cron;
pub mod goals;
pub mod health;
pub mod ingest;
pub mod script;
pub mod webhooks;
