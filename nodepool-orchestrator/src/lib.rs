pub mod admin_api;
pub mod config;
pub mod instance_launcher;
pub mod instance_registry;
pub mod provider_manager;
pub mod state_machine;
