pub mod dispatcher;
pub mod ledger;
pub mod queue;
pub mod renderer;
pub mod reporting;
pub mod state_machine;
pub mod templates;
pub mod users;
