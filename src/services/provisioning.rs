use std::sync::Arc;

use crate::{
    auth::SsoError,
    db::{DbPool, ProvisionIdentity},
    models::{DEFAULT_SSO_ORG_SLUG, ProviderConfig, Role, SsoUser, User},
};

/// Just-in-time provisioning of SSO identities into internal users.
///
/// The first login from an external identity creates the user and its
/// mapping; later logins refresh the profile. When a role can be resolved,
/// the user's membership in the `sso-users` organization is set to it.
#[derive(Clone)]
pub struct ProvisioningService {
    db: Arc<DbPool>,
}

impl ProvisioningService {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }

    /// The role a login grants.
    ///
    /// Group mappings win when any of the user's groups match (highest
    /// privilege first). Otherwise the provider's default role applies, and
    /// with no default role the membership is left as it is.
    pub fn resolve_role(user: &SsoUser, config: &ProviderConfig) -> Option<Role> {
        let mapped = if !user.groups.is_empty() && !config.group_mappings.is_empty() {
            Role::resolve(&user.groups, &config.group_mappings)
        } else {
            None
        };
        mapped.or(config.default_role)
    }

    #[tracing::instrument(
        name = "sso.provision",
        skip(self, user, config),
        fields(provider = %config.name, external_id = %user.external_id)
    )]
    pub async fn provision_user(
        &self,
        user: &SsoUser,
        config: &ProviderConfig,
    ) -> Result<User, SsoError> {
        if !config.auto_provision {
            return Err(SsoError::ProvisioningDisabled(config.name.clone()));
        }

        let role = Self::resolve_role(user, config);
        if role.is_none() {
            tracing::debug!(
                groups = user.groups.len(),
                "No role resolved; leaving organization membership unchanged"
            );
        }

        let identity = ProvisionIdentity {
            provider_id: config.id,
            external_id: user.external_id.clone(),
            username: user.username.clone(),
            email: user.email.clone(),
            full_name: user.display_name(),
            role,
            org_slug: DEFAULT_SSO_ORG_SLUG.to_string(),
        };

        let outcome = self
            .db
            .sso_identities()
            .provision(identity)
            .await
            .map_err(|e| SsoError::Provisioning(e.to_string()))?;

        tracing::info!(
            user_id = %outcome.user.id,
            created = outcome.created,
            role = role.map(|r| r.to_string()).unwrap_or_default(),
            "Provisioned SSO user"
        );

        Ok(outcome.user)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::{
        db::sqlite::test_pool,
        models::{AttributeMap, GroupMap, ProviderType, ProviderVendor},
    };

    async fn setup() -> (ProvisioningService, Arc<DbPool>, ProviderConfig) {
        let db = Arc::new(DbPool::from_sqlite(test_pool().await));
        let input = crate::auth::ProviderPreset::Okta {
            domain: "example.okta.com".to_string(),
        }
        .build("okta", "cid", "secret");
        let mut input = input;
        input.group_mappings = vec![
            GroupMap::new("Spoke-Viewers", Role::Viewer),
            GroupMap::new("Spoke-Admins", Role::Admin),
            GroupMap::new("Spoke-Devs", Role::Developer),
        ];
        let config = db.provider_configs().create(input).await.unwrap();
        (ProvisioningService::new(db.clone()), db, config)
    }

    fn sso_user(config: &ProviderConfig, external_id: &str, groups: &[&str]) -> SsoUser {
        SsoUser {
            provider_id: config.id,
            provider_name: config.name.clone(),
            external_id: external_id.to_string(),
            username: "jdoe".to_string(),
            email: "jdoe@example.com".to_string(),
            full_name: Some("Jane Doe".to_string()),
            first_name: None,
            last_name: None,
            groups: groups.iter().map(|g| g.to_string()).collect(),
            attributes: Default::default(),
            session_index: None,
        }
    }

    fn config_with(mappings: Vec<GroupMap>, default_role: Option<Role>) -> ProviderConfig {
        ProviderConfig {
            id: 1,
            name: "corp".to_string(),
            provider_type: ProviderType::Oidc,
            vendor: ProviderVendor::Generic,
            enabled: true,
            auto_provision: true,
            default_role,
            group_mappings: mappings,
            attribute_map: AttributeMap::default(),
            saml: None,
            oauth2: None,
            oidc: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_resolve_role_prefers_mapping_then_default() {
        let mappings = vec![
            GroupMap::new("Spoke-Devs", Role::Developer),
            GroupMap::new("Spoke-Admins", Role::Admin),
        ];
        let with_default = config_with(mappings.clone(), Some(Role::Viewer));
        let without_default = config_with(mappings, None);

        let admin = sso_user(&with_default, "u", &["Spoke-Devs", "Spoke-Admins"]);
        assert_eq!(
            ProvisioningService::resolve_role(&admin, &with_default),
            Some(Role::Admin)
        );

        let stranger = sso_user(&with_default, "u", &["Marketing"]);
        assert_eq!(
            ProvisioningService::resolve_role(&stranger, &with_default),
            Some(Role::Viewer)
        );
        assert_eq!(
            ProvisioningService::resolve_role(&stranger, &without_default),
            None
        );

        let no_groups = sso_user(&with_default, "u", &[]);
        assert_eq!(
            ProvisioningService::resolve_role(&no_groups, &with_default),
            Some(Role::Viewer)
        );
    }

    #[test]
    fn test_resolve_role_without_mappings_uses_default() {
        let config = config_with(vec![], Some(Role::Developer));
        let user = sso_user(&config, "u", &["Spoke-Admins"]);
        assert_eq!(
            ProvisioningService::resolve_role(&user, &config),
            Some(Role::Developer)
        );
    }

    #[tokio::test]
    async fn test_repeat_admin_login_is_idempotent() {
        let (svc, db, config) = setup().await;
        let user = sso_user(&config, "00u-spoke", &["Spoke-Admins"]);

        let first = svc.provision_user(&user, &config).await.unwrap();
        let second = svc.provision_user(&user, &config).await.unwrap();

        assert_eq!(first.id, second.id);

        let membership = db
            .users()
            .get_membership(first.id, DEFAULT_SSO_ORG_SLUG)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(membership.role, Role::Admin);
    }

    #[tokio::test]
    async fn test_profile_is_refreshed_on_login() {
        let (svc, _db, config) = setup().await;
        let mut user = sso_user(&config, "00u-1", &[]);
        svc.provision_user(&user, &config).await.unwrap();

        user.email = "jane.doe@example.com".to_string();
        user.full_name = Some("Jane Q. Doe".to_string());
        let updated = svc.provision_user(&user, &config).await.unwrap();

        assert_eq!(updated.email, "jane.doe@example.com");
        assert_eq!(updated.full_name.as_deref(), Some("Jane Q. Doe"));
    }

    #[tokio::test]
    async fn test_unmatched_groups_without_default_leave_no_membership() {
        let (svc, db, config) = setup().await;
        let user = sso_user(&config, "00u-2", &["Marketing"]);

        let provisioned = svc.provision_user(&user, &config).await.unwrap();
        assert!(
            db.users()
                .get_membership(provisioned.id, DEFAULT_SSO_ORG_SLUG)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_auto_provision_disabled() {
        let (svc, _db, mut config) = setup().await;
        config.auto_provision = false;
        let user = sso_user(&config, "00u-3", &["Spoke-Admins"]);

        let err = svc.provision_user(&user, &config).await.unwrap_err();
        assert!(matches!(err, SsoError::ProvisioningDisabled(_)));
        assert_eq!(err.status(), axum::http::StatusCode::FORBIDDEN);
    }
}
