pub mod fake_hcd;
