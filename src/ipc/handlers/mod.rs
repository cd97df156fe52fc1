pub mod assignment;
pub mod audit;
pub mod backup_exchange;
pub mod classes;
pub mod core;
pub mod enrollment;
pub mod promotion;
pub mod stats;
pub mod students;
