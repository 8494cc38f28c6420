pub mod account;
pub mod oidc;
pub mod store;
pub mod token;

pub use account::{Account, AccountSnapshot};
pub use oidc::{LoginPoll, LoginSession};
pub use store::AccountStore;
pub use token::{AccessToken, AuthProvider};
