pub mod access_gate;
pub mod chunk_store;
pub mod error;
pub mod intake_service;
pub mod object_reader;
pub mod object_writer;
pub mod submission_ledger;
