//! Library integration tests: build scripts evaluated end to end.

mod common;
mod engine_tests;
mod graph_tests;
mod lua_tests;
