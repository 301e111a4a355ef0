//! Integration tests for the plugin runtime.

mod helpers;

mod lifecycle_test;
