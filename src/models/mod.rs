use uuid::Uuid;

pub mod availability;
pub mod delivery_record;
pub mod subscriber;
pub mod target;

// Re-exports for convenience
pub use availability::*;
pub use delivery_record::*;
pub use subscriber::*;
pub use target::*;

// Helper function to generate ids in the format expected by the database
pub fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()
}
