mod token;

pub use token::TokenManager;
