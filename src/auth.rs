use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Single shared password for every user name.
#[derive(Debug)]
pub struct ClashdAuthSource {
    password: String,
}

impl ClashdAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for ClashdAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        tracing::debug!(user = ?login.user(), "password lookup");
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
