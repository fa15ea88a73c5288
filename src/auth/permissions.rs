//! Role-based permissions plus ownership checks.
//!
//! The role table is static. `Administrator` holds every permission
//! implicitly; an unrecognised role holds none.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Field names that conventionally identify a resource's owner.
pub const OWNER_FIELDS: [&str; 4] = ["owner_id", "user_id", "created_by", "author_id"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ViewContent,
    CreateContent,
    EditContent,
    DeleteContent,
    SubmitAssignments,
    GradeAssignments,
    ViewProgress,
    ViewAllProgress,
    ManageUsers,
    ManageSettings,
}

impl Permission {
    pub const ALL: [Permission; 10] = [
        Self::ViewContent,
        Self::CreateContent,
        Self::EditContent,
        Self::DeleteContent,
        Self::SubmitAssignments,
        Self::GradeAssignments,
        Self::ViewProgress,
        Self::ViewAllProgress,
        Self::ManageUsers,
        Self::ManageSettings,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ViewContent => "view_content",
            Self::CreateContent => "create_content",
            Self::EditContent => "edit_content",
            Self::DeleteContent => "delete_content",
            Self::SubmitAssignments => "submit_assignments",
            Self::GradeAssignments => "grade_assignments",
            Self::ViewProgress => "view_progress",
            Self::ViewAllProgress => "view_all_progress",
            Self::ManageUsers => "manage_users",
            Self::ManageSettings => "manage_settings",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL.into_iter().find(|p| p.as_str() == normalized)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Student,
    Instructor,
    Administrator,
    /// Anything not recognised. Grants nothing.
    #[serde(other)]
    Unknown,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Instructor => "instructor",
            Self::Administrator => "administrator",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "student" => Self::Student,
            "instructor" | "teacher" => Self::Instructor,
            "administrator" | "admin" => Self::Administrator,
            _ => Self::Unknown,
        }
    }
}

/// Explicit grants per role. `Administrator` is absent on purpose: it is
/// resolved to the universal set in [`permissions_for`].
fn granted(role: Role) -> &'static [Permission] {
    use Permission::*;
    match role {
        Role::Student => &[ViewContent, SubmitAssignments, ViewProgress],
        Role::Instructor => &[
            ViewContent,
            CreateContent,
            EditContent,
            DeleteContent,
            GradeAssignments,
            ViewProgress,
            ViewAllProgress,
        ],
        Role::Administrator | Role::Unknown => &[],
    }
}

/// Permission set for a role. Unknown roles map to the empty set.
pub fn permissions_for(role: Role) -> HashSet<Permission> {
    match role {
        Role::Administrator => Permission::ALL.into_iter().collect(),
        other => granted(other).iter().copied().collect(),
    }
}

/// Anything that can act: a loaded user record or a session.
pub trait Principal {
    fn principal_id(&self) -> &str;

    fn role(&self) -> Role;

    fn is_admin(&self) -> bool {
        self.role() == Role::Administrator
    }
}

/// A resource that may carry an owner field.
pub trait Resource {
    /// String form of a top-level field, if present and scalar.
    fn field_as_string(&self, name: &str) -> Option<String>;
}

impl Resource for serde_json::Value {
    fn field_as_string(&self, name: &str) -> Option<String> {
        match self.get(name)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

impl Resource for HashMap<String, String> {
    fn field_as_string(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

pub fn has_permission<P: Principal + ?Sized>(user: &P, permission: Permission) -> bool {
    if user.is_admin() {
        return true;
    }
    granted(user.role()).contains(&permission)
}

pub fn has_all<P: Principal + ?Sized>(user: &P, permissions: &[Permission]) -> bool {
    permissions.iter().all(|p| has_permission(user, *p))
}

pub fn has_any<P: Principal + ?Sized>(user: &P, permissions: &[Permission]) -> bool {
    permissions.iter().any(|p| has_permission(user, *p))
}

/// True when one of [`OWNER_FIELDS`] on the resource equals the user's id.
pub fn is_owner<P, R>(user: &P, resource: Option<&R>) -> bool
where
    P: Principal + ?Sized,
    R: Resource + ?Sized,
{
    let Some(resource) = resource else {
        return false;
    };
    OWNER_FIELDS.iter().any(|field| {
        resource
            .field_as_string(field)
            .is_some_and(|owner| owner == user.principal_id())
    })
}

/// The standard authorization decision: the permission grants access to
/// every resource of its class, ownership grants access to one's own.
pub fn has_access<P, R>(user: &P, resource: Option<&R>, permission: Permission) -> bool
where
    P: Principal + ?Sized,
    R: Resource + ?Sized,
{
    has_permission(user, permission) || is_owner(user, resource)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Actor {
        id: String,
        role: Role,
    }

    impl Principal for Actor {
        fn principal_id(&self) -> &str {
            &self.id
        }
        fn role(&self) -> Role {
            self.role
        }
    }

    fn actor(id: &str, role: Role) -> Actor {
        Actor {
            id: id.into(),
            role,
        }
    }

    #[test]
    fn administrator_holds_everything() {
        let admin = actor("1", Role::Administrator);
        for permission in Permission::ALL {
            assert!(has_permission(&admin, permission));
        }
        assert_eq!(permissions_for(Role::Administrator).len(), Permission::ALL.len());
    }

    #[test]
    fn unknown_role_holds_nothing() {
        assert!(permissions_for(Role::Unknown).is_empty());
        let ghost = actor("1", Role::Unknown);
        assert!(!has_permission(&ghost, Permission::ViewContent));
        assert!(!has_any(&ghost, &Permission::ALL));
    }

    #[test]
    fn student_can_view_but_not_edit() {
        let student = actor("7", Role::Student);
        assert!(has_permission(&student, Permission::ViewContent));
        assert!(!has_permission(&student, Permission::EditContent));
        assert!(has_all(
            &student,
            &[Permission::ViewContent, Permission::SubmitAssignments]
        ));
        assert!(!has_all(
            &student,
            &[Permission::ViewContent, Permission::ManageUsers]
        ));
        assert!(has_any(
            &student,
            &[Permission::ManageUsers, Permission::ViewProgress]
        ));
    }

    #[test]
    fn instructor_cannot_manage_users() {
        let instructor = actor("3", Role::Instructor);
        assert!(has_permission(&instructor, Permission::EditContent));
        assert!(!has_permission(&instructor, Permission::ManageUsers));
    }

    #[test]
    fn has_all_of_nothing_is_true() {
        let ghost = actor("1", Role::Unknown);
        assert!(has_all(&ghost, &[]));
        assert!(!has_any(&ghost, &[]));
    }

    #[test]
    fn ownership_across_field_names() {
        let user = actor("42", Role::Student);
        assert!(is_owner(&user, Some(&json!({"owner_id": "42"}))));
        assert!(is_owner(&user, Some(&json!({"user_id": 42}))));
        assert!(is_owner(&user, Some(&json!({"created_by": "42"}))));
        assert!(is_owner(&user, Some(&json!({"author_id": 42, "title": "x"}))));
        assert!(!is_owner(&user, Some(&json!({"owner_id": "43"}))));
        assert!(!is_owner(&user, Some(&json!({"title": "no owner"}))));
        assert!(!is_owner(&user, Some(&json!({"owner_id": null}))));
        assert!(!is_owner(&user, None::<&serde_json::Value>));
    }

    #[test]
    fn ownership_with_string_map() {
        let user = actor("abc", Role::Student);
        let mut resource = HashMap::new();
        resource.insert("created_by".to_string(), "abc".to_string());
        assert!(is_owner(&user, Some(&resource)));
    }

    #[test]
    fn access_by_ownership_without_permission() {
        let student = actor("42", Role::Student);
        let own = json!({"id": 1, "owner_id": "42"});
        let other = json!({"id": 2, "owner_id": "99"});
        assert!(has_access(&student, Some(&own), Permission::EditContent));
        assert!(!has_access(&student, Some(&other), Permission::EditContent));
        assert!(!has_access(&student, None::<&serde_json::Value>, Permission::EditContent));
    }

    #[test]
    fn access_by_permission_without_ownership() {
        let instructor = actor("3", Role::Instructor);
        let other = json!({"owner_id": "99"});
        assert!(has_access(&instructor, Some(&other), Permission::EditContent));
    }

    #[test]
    fn role_parsing_is_lossy() {
        assert_eq!(Role::from_str_lossy("Admin"), Role::Administrator);
        assert_eq!(Role::from_str_lossy(" student "), Role::Student);
        assert_eq!(Role::from_str_lossy("janitor"), Role::Unknown);
        let role: Role = serde_json::from_str("\"janitor\"").unwrap();
        assert_eq!(role, Role::Unknown);
        let role: Role = serde_json::from_str("\"instructor\"").unwrap();
        assert_eq!(role, Role::Instructor);
    }

    #[test]
    fn permission_parsing() {
        assert_eq!(Permission::parse("view-content"), Some(Permission::ViewContent));
        assert_eq!(Permission::parse("MANAGE_USERS"), Some(Permission::ManageUsers));
        assert_eq!(Permission::parse("fly"), None);
    }
}
