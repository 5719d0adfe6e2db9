pub mod backup;
pub mod core;
pub mod enrollments;
pub mod faculties;
pub mod grades;
pub mod inventory;
pub mod library;
pub mod reports;
pub mod requests;
pub mod setup;
pub mod students;
pub mod subjects;
