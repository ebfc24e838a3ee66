pub mod admin_db;
pub mod assessments;
pub mod core;
pub mod moderation;
pub mod retention;
pub mod timetable;
pub mod users;
