//! Tests for the ringlet-engine crate.

mod helpers;

mod basic;
