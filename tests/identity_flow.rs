use std::sync::Arc;
use studyhall::auth::{MemoryUserRepository, SqliteUserRepository, UserRepository};
use studyhall::config::{IdentityConfig, PasswordConfig, SessionConfig};
use studyhall::{BackendKind, ErrorKind, IdentityService, Permission, Registration, Role};
use tempfile::TempDir;

fn fast_config(sessions: SessionConfig) -> IdentityConfig {
    IdentityConfig {
        sessions,
        password: PasswordConfig::fast_insecure(),
        ..IdentityConfig::default()
    }
}

fn persistent_config(dir: &TempDir) -> IdentityConfig {
    fast_config(SessionConfig {
        persistent: true,
        database_path: Some(dir.path().join("sessions.db")),
        fallback_to_memory: false,
        ..SessionConfig::default()
    })
}

#[test]
fn student_registers_logs_in_and_reads_content() {
    let config = fast_config(SessionConfig::in_memory());
    let service =
        IdentityService::from_config(&config, Arc::new(MemoryUserRepository::new())).unwrap();

    let user_id = service
        .register(Registration::new("alice", "alice@x.com", "Str0ng!Pw"))
        .unwrap();
    assert!(!user_id.is_empty());

    let err = service
        .register(Registration::new("alice", "alice2@x.com", "Str0ng!Pw"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.user_message().contains("taken"));

    let outcome = service.login("alice@x.com", "Str0ng!Pw").unwrap();
    assert!(!outcome.token.is_empty());
    assert_eq!(outcome.user.id, user_id);
    assert!(service.check_permission(&outcome.token, Permission::ViewContent));
    assert!(!service.check_permission(&outcome.token, Permission::GradeAssignments));

    assert!(service.logout(&outcome.token).unwrap());
    assert!(!service.check_permission(&outcome.token, Permission::ViewContent));
}

#[test]
fn sessions_and_reset_tokens_survive_restart_on_persistent_backend() {
    let tmp = TempDir::new().unwrap();
    let config = persistent_config(&tmp);
    let users_path = tmp.path().join("users.db");

    let (session_token, reset_token) = {
        let users: Arc<dyn UserRepository> =
            Arc::new(SqliteUserRepository::open(&users_path).unwrap());
        let service = IdentityService::from_config(&config, users).unwrap();
        assert_eq!(service.sessions().backend_kind(), BackendKind::Persistent);

        service
            .register(
                Registration::new("prof", "prof@uni.edu", "Str0ng!Pw").role(Role::Instructor),
            )
            .unwrap();
        let session = service.login("prof", "Str0ng!Pw").unwrap().token;
        let reset = service
            .request_password_reset("prof@uni.edu")
            .unwrap()
            .unwrap();
        (session, reset)
    };

    let users: Arc<dyn UserRepository> = Arc::new(SqliteUserRepository::open(&users_path).unwrap());
    let service = IdentityService::from_config(&config, users).unwrap();

    assert!(service.check_permission(&session_token, Permission::GradeAssignments));
    let profile = service.current_user(&session_token).unwrap().unwrap();
    assert_eq!(profile.role, Role::Instructor);

    service
        .reset_password(&reset_token, "Fr3sh!Passw0rd")
        .unwrap();
    assert!(!service.check_permission(&session_token, Permission::ViewContent));
    assert!(service.login("prof@uni.edu", "Fr3sh!Passw0rd").is_ok());
}

#[test]
fn unreachable_persistent_store_falls_back_to_memory() {
    let tmp = TempDir::new().unwrap();
    let blocker = tmp.path().join("not-a-dir");
    std::fs::write(&blocker, b"file").unwrap();

    let mut config = persistent_config(&tmp);
    config.sessions.database_path = Some(blocker.join("sessions.db"));
    config.sessions.fallback_to_memory = true;

    let service =
        IdentityService::from_config(&config, Arc::new(MemoryUserRepository::new())).unwrap();
    assert_eq!(service.sessions().backend_kind(), BackendKind::Memory);

    service
        .register(Registration::new("bob", "bob@x.com", "Str0ng!Pw"))
        .unwrap();
    let token = service.login("bob", "Str0ng!Pw").unwrap().token;
    assert!(service.check_permission(&token, Permission::SubmitAssignments));

    config.sessions.fallback_to_memory = false;
    let err = IdentityService::from_config(&config, Arc::new(MemoryUserRepository::new()))
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
}

#[test]
fn duplicate_registration_is_rejected_by_sqlite_repository() {
    let tmp = TempDir::new().unwrap();
    let users: Arc<dyn UserRepository> =
        Arc::new(SqliteUserRepository::open(&tmp.path().join("users.db")).unwrap());
    let service =
        IdentityService::from_config(&fast_config(SessionConfig::in_memory()), users).unwrap();

    service
        .register(Registration::new("carol", "carol@x.com", "Str0ng!Pw"))
        .unwrap();
    let by_email = service
        .register(Registration::new("carol2", "CAROL@x.com", "Str0ng!Pw"))
        .unwrap_err();
    let by_name = service
        .register(Registration::new("CAROL", "c2@x.com", "Str0ng!Pw"))
        .unwrap_err();
    assert_ne!(by_email.user_message(), by_name.user_message());
}
