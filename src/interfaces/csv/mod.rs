pub mod outcome_writer;
pub mod transaction_reader;
