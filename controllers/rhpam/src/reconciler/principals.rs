//! Roles and users every RHPAM realm must keep.
//!
//! Business Central and the KIE server log in to each other and to the
//! Maven repository with these accounts, so identity convergence never
//! deletes them. Keycloak's own realm roles are protected the same way.

use crds::UserSpec;

/// A built-in account with a fixed password and role set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultUser {
    pub username: &'static str,
    pub password: &'static str,
    pub roles: &'static [&'static str],
}

impl DefaultUser {
    fn to_spec(self) -> UserSpec {
        UserSpec {
            username: self.username.to_string(),
            password: self.password.to_string(),
            roles: self.roles.iter().map(ToString::to_string).collect(),
        }
    }
}

pub const DEFAULT_ROLES: [&str; 7] = [
    "admin",
    "process-admin",
    "manager",
    "analyst",
    "developer",
    "user",
    "kie-server",
];

pub const ADMIN_USER: DefaultUser = DefaultUser {
    username: "adminuser",
    password: "admin1!",
    roles: &["admin", "kie-server"],
};

pub const CONTROLLER_USER: DefaultUser = DefaultUser {
    username: "controlleruser",
    password: "controller1!",
    roles: &["kie-server"],
};

pub const MAVEN_USER: DefaultUser = DefaultUser {
    username: "mavenuser",
    password: "maven1!",
    roles: &[],
};

pub const EXECUTION_USER: DefaultUser = DefaultUser {
    username: "executionuser",
    password: "execution1!",
    roles: &["kie-server"],
};

/// Realm roles Keycloak creates on its own
pub fn is_system_role(name: &str) -> bool {
    matches!(name, "offline_access" | "uma_authorization") || name.starts_with("default-roles-")
}

/// The protected role and user set handed to the convergence engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultPrincipals {
    roles: Vec<String>,
    users: Vec<UserSpec>,
}

impl Default for DefaultPrincipals {
    fn default() -> Self {
        Self {
            roles: DEFAULT_ROLES.iter().map(ToString::to_string).collect(),
            users: [ADMIN_USER, CONTROLLER_USER, MAVEN_USER, EXECUTION_USER]
                .into_iter()
                .map(DefaultUser::to_spec)
                .collect(),
        }
    }
}

impl DefaultPrincipals {
    #[must_use]
    pub fn new(roles: Vec<String>, users: Vec<UserSpec>) -> Self {
        Self { roles, users }
    }

    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    pub fn users(&self) -> &[UserSpec] {
        &self.users
    }

    /// Default or Keycloak system role; never deleted or unmapped
    pub fn is_protected_role(&self, name: &str) -> bool {
        is_system_role(name) || self.roles.iter().any(|r| r == name)
    }

    /// The default account named `username`, compared case-insensitively
    /// because Keycloak stores usernames in lower case
    pub fn default_user(&self, username: &str) -> Option<&UserSpec> {
        self.users.iter().find(|u| u.username.eq_ignore_ascii_case(username))
    }

    pub fn is_default_user(&self, username: &str) -> bool {
        self.default_user(username).is_some()
    }
}
