pub mod delivery_processor;
