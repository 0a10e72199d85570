pub mod welcome_email;

pub use welcome_email::{WelcomeEmailHandler, SEND_WELCOME_EMAIL};
