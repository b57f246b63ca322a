pub mod custom_types;
