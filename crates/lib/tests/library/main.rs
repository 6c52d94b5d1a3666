mod engine_tests;
mod placement_tests;
