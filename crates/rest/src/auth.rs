//! Callers and the principals they act as.

use async_trait::async_trait;

use query_engine_execution::error::Error;

/// The identity a request is made under.
///
/// Role names returned by [`Auth::user_roles`] are expected in their ACL
/// form, `role:<name>`, so they can be matched against `_rperm`/`_wperm`
/// entries directly.
#[async_trait]
pub trait Auth: Send + Sync {
    fn is_master(&self) -> bool;
    fn user_id(&self) -> Option<&str>;
    async fn user_roles(&self) -> Result<Vec<String>, Error>;
}

/// Master-key access. Bypasses row-level permissions entirely.
#[derive(Debug, Clone, Copy, Default)]
pub struct Master;

#[async_trait]
impl Auth for Master {
    fn is_master(&self) -> bool {
        true
    }

    fn user_id(&self) -> Option<&str> {
        None
    }

    async fn user_roles(&self) -> Result<Vec<String>, Error> {
        Ok(vec![])
    }
}

/// Unauthenticated access. Only rows readable by `*` are visible.
#[derive(Debug, Clone, Copy, Default)]
pub struct Public;

#[async_trait]
impl Auth for Public {
    fn is_master(&self) -> bool {
        false
    }

    fn user_id(&self) -> Option<&str> {
        None
    }

    async fn user_roles(&self) -> Result<Vec<String>, Error> {
        Ok(vec![])
    }
}

/// A session bound to a user and their resolved roles.
#[derive(Debug, Clone, Default)]
pub struct UserSession {
    pub user_id: String,
    pub roles: Vec<String>,
}

#[async_trait]
impl Auth for UserSession {
    fn is_master(&self) -> bool {
        false
    }

    fn user_id(&self) -> Option<&str> {
        Some(&self.user_id)
    }

    async fn user_roles(&self) -> Result<Vec<String>, Error> {
        Ok(self.roles.clone())
    }
}

/// The principal list a non-master caller queries as: `*`, each of their
/// roles, and their user id. Master callers get `None`, which disables row
/// security altogether.
pub async fn acl_for(auth: &dyn Auth) -> Result<Option<Vec<String>>, Error> {
    if auth.is_master() {
        return Ok(None);
    }
    let mut acl = vec!["*".to_string()];
    acl.extend(auth.user_roles().await?);
    if let Some(user_id) = auth.user_id() {
        acl.push(user_id.to_string());
    }
    Ok(Some(acl))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn master_bypasses_row_security() {
        assert_eq!(acl_for(&Master).await.unwrap(), None);
    }

    #[tokio::test]
    async fn public_gets_only_the_wildcard() {
        assert_eq!(
            acl_for(&Public).await.unwrap(),
            Some(vec!["*".to_string()])
        );
    }

    #[tokio::test]
    async fn a_session_contributes_roles_and_user_id() {
        let session = UserSession {
            user_id: "u1".to_string(),
            roles: vec!["role:admin".to_string()],
        };
        assert_eq!(
            acl_for(&session).await.unwrap(),
            Some(vec![
                "*".to_string(),
                "role:admin".to_string(),
                "u1".to_string()
            ])
        );
    }
}
