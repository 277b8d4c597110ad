//! Integration tests for the atelier orchestration core

mod artifact_store;
mod config_integration;
mod scheduler_scenarios;
mod test_utils;
