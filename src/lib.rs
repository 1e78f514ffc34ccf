//! Empty crate root: this package exists only to host the end-to-end
//! integration test suites under `tests/integration/`. All real code lives
//! in `crates/` and `services/gateway`.
