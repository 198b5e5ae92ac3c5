use crate::model::Role;
use crate::remote::RemoteStore;

/// Legacy access gate. Not credential storage, just the literal the app
/// has always shipped; kept as the fallback for sessions without a user id.
const TEACHER_PASSWORD: &str = "teacherme";

#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
}

/// Explicit session context, passed to handlers instead of living in a
/// global. The role is resolved once at login and is the single source of
/// truth afterwards: a resolvable `profiles` row wins, the password
/// literal is only the no-user migration shim.
pub struct SessionContext {
    user: Option<User>,
    role: Role,
    owned_teacher_id: Option<String>,
}

impl SessionContext {
    pub fn new() -> SessionContext {
        SessionContext {
            user: None,
            role: Role::Viewer,
            owned_teacher_id: None,
        }
    }

    pub fn login(
        &mut self,
        user_id: Option<&str>,
        password: Option<&str>,
        remote: Option<&dyn RemoteStore>,
    ) -> bool {
        if let (Some(uid), Some(remote)) = (user_id, remote) {
            if let Ok(Some(role)) = remote.fetch_role(uid) {
                self.user = Some(User {
                    id: uid.to_string(),
                });
                self.role = role;
                return true;
            }
        }
        if password == Some(TEACHER_PASSWORD) {
            self.user = user_id.map(|id| User { id: id.to_string() });
            self.role = Role::Teacher;
            return true;
        }
        false
    }

    pub fn logout(&mut self) {
        self.user = None;
        self.role = Role::Viewer;
        self.owned_teacher_id = None;
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_teacher(&self) -> bool {
        self.role == Role::Teacher
    }

    /// The one teacher record this session manages, if any. Each user can
    /// only own one.
    pub fn owned_teacher_id(&self) -> Option<&str> {
        self.owned_teacher_id.as_deref()
    }

    pub fn set_owned_teacher(&mut self, teacher_id: Option<String>) {
        self.owned_teacher_id = teacher_id;
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        SessionContext::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteRemote;

    #[test]
    fn password_literal_grants_teacher_role() {
        let mut session = SessionContext::new();
        assert!(!session.login(None, Some("wrong"), None));
        assert_eq!(session.role(), Role::Viewer);

        assert!(session.login(None, Some("teacherme"), None));
        assert!(session.is_teacher());

        session.logout();
        assert_eq!(session.role(), Role::Viewer);
    }

    #[test]
    fn profile_row_is_authoritative_over_password() {
        let remote = SqliteRemote::in_memory().expect("open remote");
        remote
            .connection()
            .execute(
                "INSERT INTO profiles(id, role) VALUES('u1', 'viewer')",
                [],
            )
            .expect("seed profile");

        let mut session = SessionContext::new();
        // Profile says viewer; the password shim must not override it.
        assert!(session.login(Some("u1"), Some("teacherme"), Some(&remote)));
        assert_eq!(session.role(), Role::Viewer);
        assert_eq!(session.user().map(|u| u.id.as_str()), Some("u1"));
    }

    #[test]
    fn unknown_user_falls_back_to_password_shim() {
        let remote = SqliteRemote::in_memory().expect("open remote");
        let mut session = SessionContext::new();
        assert!(session.login(Some("ghost"), Some("teacherme"), Some(&remote)));
        assert!(session.is_teacher());
        assert!(!session.login(Some("ghost"), Some("nope"), Some(&remote)));
    }
}
