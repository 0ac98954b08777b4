//! Per-release descriptor of the Monitor API surface.
//!
//! [`Profile::for_release`] is a pure function of the release number. It is
//! table-driven: a single literal description of the 4.0 surface plus an
//! ordered sequence of diffs (4.4, 5.0, 5.2, 5.4, 6.0, 6.2, 6.4, 7.0)
//! applied in order. Later diffs override earlier ones; removed kinds
//! disappear from the method table.

use crate::error::PreconditionError;
use crate::kind::EntityKind;
use crate::release::Release;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;

/// How a kind is fetched: its id field, its name field, and the `get`
/// options that pull exactly the replicated shape.
///
/// Singleton kinds carry neither id nor name field.
#[derive(Debug, Clone)]
pub struct MethodSpec {
    pub id_field: Option<&'static str>,
    pub name_field: Option<&'static str>,
    pub get_options: Value,
}

/// Rules for one section of a configuration import bundle. Only the flags
/// present are sent; the Monitor treats absence as false.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_missing: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_existing: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_missing: Option<bool>,
}

impl ImportRule {
    fn create() -> Self {
        ImportRule {
            create_missing: Some(true),
            ..Default::default()
        }
    }

    fn create_update() -> Self {
        ImportRule {
            create_missing: Some(true),
            update_existing: Some(true),
            ..Default::default()
        }
    }

    fn create_delete() -> Self {
        ImportRule {
            create_missing: Some(true),
            delete_missing: Some(true),
            ..Default::default()
        }
    }

    fn full() -> Self {
        ImportRule {
            create_missing: Some(true),
            update_existing: Some(true),
            delete_missing: Some(true),
        }
    }

    fn disabled(with_delete: bool) -> Self {
        ImportRule {
            create_missing: Some(false),
            update_existing: Some(false),
            delete_missing: with_delete.then_some(false),
        }
    }
}

/// A named processing section of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Global,
    Pre,
    Mid,
    Post,
    Account,
    Extend,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Section::Global => "GLOBAL",
            Section::Pre => "PRE",
            Section::Mid => "MID",
            Section::Post => "POST",
            Section::Account => "ACCOUNT",
            Section::Extend => "EXTEND",
        };
        f.write_str(name)
    }
}

/// Items that hosted Monitor variants either lack or refuse to delete.
#[derive(Debug, Clone, Default)]
pub struct CloudOverrides {
    /// Per-kind entity names that cannot be deleted on hosted variants.
    pub undeletable: BTreeMap<EntityKind, Vec<&'static str>>,
    /// Role rule names that do not exist on hosted variants.
    pub role_rules: Vec<&'static str>,
    /// Authentication fields that do not exist on hosted variants.
    pub authentication_fields: Vec<&'static str>,
}

/// Declarative description of one release's API surface.
#[derive(Debug, Clone)]
pub struct Profile {
    pub release: Release,
    methods: BTreeMap<EntityKind, MethodSpec>,
    global: Vec<EntityKind>,
    pre: Vec<EntityKind>,
    mid: Vec<EntityKind>,
    post: Vec<EntityKind>,
    account: Vec<EntityKind>,
    config_export: BTreeMap<EntityKind, &'static str>,
    config_import: BTreeMap<Release, BTreeMap<&'static str, EntityKind>>,
    import_rules: BTreeMap<&'static str, ImportRule>,
    added_in: BTreeMap<EntityKind, Release>,
    discard_fields: BTreeMap<EntityKind, Vec<&'static str>>,
    auth_ldap_fields: Vec<&'static str>,
    auth_saml_fields: Vec<&'static str>,
    timeout_targets: Vec<&'static str>,
    cloud_overrides: CloudOverrides,
    id_fields: BTreeMap<&'static str, EntityKind>,
}

impl Profile {
    /// Build the profile for a release. Out-of-range releases are a fatal
    /// precondition failure.
    pub fn for_release(release: Release) -> Result<Profile, PreconditionError> {
        if !release.is_supported() {
            return Err(PreconditionError::UnsupportedRelease(release.to_string()));
        }
        let mut profile = Profile::base_4_0(release);
        if release >= Release::R4_4 {
            profile.apply_4_4();
        }
        if release >= Release::R5_0 {
            profile.apply_5_0();
        }
        if release >= Release::R5_2 {
            profile.apply_5_2();
        }
        if release >= Release::R5_4 {
            profile.apply_5_4();
        }
        if release >= Release::R6_0 {
            profile.apply_6_0();
        }
        if release >= Release::R6_2 {
            profile.apply_6_2();
        }
        if release >= Release::R6_4 {
            profile.apply_6_4();
        }
        if release >= Release::R7_0 {
            profile.apply_7_0();
        }
        profile.index_id_fields();
        Ok(profile)
    }

    /// Kinds fetched with plain `get` calls, i.e. everything with a method
    /// spec at this release.
    pub fn kinds(&self) -> impl Iterator<Item = EntityKind> + '_ {
        self.methods.keys().copied()
    }

    pub fn has_kind(&self, kind: EntityKind) -> bool {
        self.methods.contains_key(&kind)
    }

    pub fn method(&self, kind: EntityKind) -> Option<&MethodSpec> {
        self.methods.get(&kind)
    }

    pub fn id_field(&self, kind: EntityKind) -> Option<&'static str> {
        self.methods.get(&kind).and_then(|m| m.id_field)
    }

    pub fn name_field(&self, kind: EntityKind) -> Option<&'static str> {
        self.methods.get(&kind).and_then(|m| m.name_field)
    }

    /// The kinds of a pipeline section, in apply order. `EXTEND` is
    /// populated at run time by deletion sidecars and is empty here.
    pub fn section_kinds(&self, section: Section) -> &[EntityKind] {
        match section {
            Section::Global => &self.global,
            Section::Pre => &self.pre,
            Section::Mid => &self.mid,
            Section::Post => &self.post,
            Section::Account => &self.account,
            Section::Extend => &[],
        }
    }

    /// Kind → section name inside an export bundle.
    pub fn config_export(&self) -> &BTreeMap<EntityKind, &'static str> {
        &self.config_export
    }

    /// Bundle section → kind mapping applicable to a snapshot produced by
    /// `master_release`. Later release tables override earlier ones per
    /// kind, so a 6.2+ snapshot maps `host_groups` while a 4.0 snapshot
    /// maps `groups`.
    pub fn import_sections_for(&self, master_release: Release) -> BTreeMap<EntityKind, &'static str> {
        let mut merged: BTreeMap<EntityKind, &'static str> = BTreeMap::new();
        for (threshold, table) in &self.config_import {
            if *threshold > master_release {
                continue;
            }
            for (section, kind) in table {
                merged.insert(*kind, section);
            }
        }
        merged
    }

    /// The import rule table for `configuration.import`.
    pub fn import_rules(&self) -> &BTreeMap<&'static str, ImportRule> {
        &self.import_rules
    }

    /// The release a kind first appeared in. Callers skip kinds newer than
    /// the release they talk to.
    pub fn added_in(&self, kind: EntityKind) -> Option<Release> {
        self.added_in.get(&kind).copied()
    }

    /// Fields the API returns for a kind but rejects on write.
    pub fn discard_fields(&self, kind: EntityKind) -> &[&'static str] {
        self.discard_fields
            .get(&kind)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// LDAP fields of the authentication singleton (movable to a user
    /// directory from 6.2 on).
    pub fn auth_ldap_fields(&self) -> &[&'static str] {
        &self.auth_ldap_fields
    }

    /// SAML fields of the authentication singleton (movable to a user
    /// directory from 6.4 on).
    pub fn auth_saml_fields(&self) -> &[&'static str] {
        &self.auth_saml_fields
    }

    /// Per-check-type timeout knobs (7.0 and later; empty before).
    pub fn timeout_targets(&self) -> &[&'static str] {
        &self.timeout_targets
    }

    pub fn cloud_overrides(&self) -> &CloudOverrides {
        &self.cloud_overrides
    }

    /// Reverse lookup for generic id-renaming walks: which kind does an id
    /// field name belong to. Where host and template groups share
    /// `groupid`, the host group wins - template groups are never the
    /// target of a generic walk.
    pub fn kind_for_id_field(&self, field: &str) -> Option<EntityKind> {
        self.id_fields.get(field).copied()
    }

    fn index_id_fields(&mut self) {
        self.id_fields.clear();
        for (kind, spec) in &self.methods {
            if let Some(field) = spec.id_field {
                self.id_fields.insert(field, *kind);
            }
        }
        self.id_fields.insert("groupid", EntityKind::HostGroup);
    }

    // ------------------------------------------------------------------
    // Release tables. One literal base plus one diff per release.
    // ------------------------------------------------------------------

    fn base_4_0(release: Release) -> Profile {
        let mut methods = BTreeMap::new();
        methods.insert(
            EntityKind::HostGroup,
            MethodSpec {
                id_field: Some("groupid"),
                name_field: Some("name"),
                get_options: json!({"output": "extend"}),
            },
        );
        methods.insert(
            EntityKind::Host,
            MethodSpec {
                id_field: Some("hostid"),
                name_field: Some("host"),
                get_options: json!({
                    "output": ["hostid", "host"],
                    "selectTags": ["tag", "value"],
                }),
            },
        );
        methods.insert(
            EntityKind::Template,
            MethodSpec {
                id_field: Some("templateid"),
                name_field: Some("name"),
                get_options: json!({"output": ["templateid", "name"]}),
            },
        );
        methods.insert(
            EntityKind::User,
            MethodSpec {
                id_field: Some("userid"),
                name_field: Some("alias"),
                get_options: json!({
                    "output": ["alias", "type"],
                    "getAccess": true,
                    "selectUsrgrps": ["name"],
                    "selectMedias": "extend",
                }),
            },
        );
        methods.insert(
            EntityKind::UserGroup,
            MethodSpec {
                id_field: Some("usrgrpid"),
                name_field: Some("name"),
                get_options: json!({
                    "output": "extend",
                    "selectTagFilters": "extend",
                    "selectRights": "extend",
                }),
            },
        );
        // Host-level macros travel inside the configuration bundle; only
        // global macros are fetched directly.
        methods.insert(
            EntityKind::UserMacroGlobal,
            MethodSpec {
                id_field: Some("globalmacroid"),
                name_field: Some("macro"),
                get_options: json!({
                    "output": ["macro", "value"],
                    "globalmacro": true,
                }),
            },
        );
        methods.insert(
            EntityKind::MediaType,
            MethodSpec {
                id_field: Some("mediatypeid"),
                name_field: Some("description"),
                get_options: json!({"output": "extend"}),
            },
        );
        methods.insert(
            EntityKind::Action,
            MethodSpec {
                id_field: Some("actionid"),
                name_field: Some("name"),
                get_options: json!({
                    "output": "extend",
                    "selectOperations": "extend",
                    "selectRecoveryOperations": "extend",
                    "selectAcknowledgeOperations": "extend",
                    "selectFilter": "extend",
                    // Trigger-direct conditions are not portable between
                    // nodes and are excluded at the query.
                    "search": {"conditiontype": [2]},
                }),
            },
        );
        methods.insert(
            EntityKind::Maintenance,
            MethodSpec {
                id_field: Some("maintenanceid"),
                name_field: Some("name"),
                get_options: json!({
                    "selectGroups": "extend",
                    "selectHosts": "extend",
                    "selectTimeperiods": "extend",
                    "selectTags": "extend",
                }),
            },
        );
        methods.insert(
            EntityKind::Script,
            MethodSpec {
                id_field: Some("scriptid"),
                name_field: Some("name"),
                get_options: json!({}),
            },
        );
        methods.insert(
            EntityKind::ValueMap,
            MethodSpec {
                id_field: Some("valuemapid"),
                name_field: Some("name"),
                get_options: json!({
                    "output": "extend",
                    "selectMappings": "extend",
                }),
            },
        );
        // PSK material is never fetched so it can never land in a store.
        methods.insert(
            EntityKind::Proxy,
            MethodSpec {
                id_field: Some("proxyid"),
                name_field: Some("host"),
                get_options: json!({
                    "output": [
                        "host",
                        "status",
                        "proxy_address",
                        "tls_connect",
                        "tls_accept",
                        "tls_issuer",
                        "tls_subject",
                        "description",
                    ],
                    "selectInterface": ["useip", "ip", "dns", "port"],
                }),
            },
        );
        methods.insert(
            EntityKind::DiscoveryRule,
            MethodSpec {
                id_field: Some("druleid"),
                name_field: Some("name"),
                get_options: json!({
                    "output": "extend",
                    "selectDChecks": "extend",
                }),
            },
        );
        methods.insert(
            EntityKind::Correlation,
            MethodSpec {
                id_field: Some("correlationid"),
                name_field: Some("name"),
                get_options: json!({
                    "output": "extend",
                    "selectOperations": "extend",
                    "selectFilter": "extend",
                    "filter": {"status": "0"},
                }),
            },
        );

        let mut config_export = BTreeMap::new();
        config_export.insert(EntityKind::HostGroup, "groups");
        config_export.insert(EntityKind::Template, "templates");
        config_export.insert(EntityKind::Host, "hosts");
        config_export.insert(EntityKind::ValueMap, "valueMaps");
        config_export.insert(EntityKind::Trigger, "triggers");

        let mut config_import = BTreeMap::new();
        let mut base_import: BTreeMap<&'static str, EntityKind> = BTreeMap::new();
        base_import.insert("groups", EntityKind::HostGroup);
        base_import.insert("templates", EntityKind::Template);
        base_import.insert("hosts", EntityKind::Host);
        base_import.insert("value_maps", EntityKind::ValueMap);
        base_import.insert("triggers", EntityKind::Trigger);
        config_import.insert(Release::R4_0, base_import);

        let mut import_rules = BTreeMap::new();
        import_rules.insert("applications", ImportRule::create_delete());
        import_rules.insert("groups", ImportRule::create());
        import_rules.insert("hosts", ImportRule::create_update());
        import_rules.insert("templateLinkage", ImportRule::create_delete());
        import_rules.insert("templates", ImportRule::create_update());
        import_rules.insert("items", ImportRule::full());
        import_rules.insert("discoveryRules", ImportRule::full());
        import_rules.insert("triggers", ImportRule::full());
        import_rules.insert("valueMaps", ImportRule::create_update());
        // Unsupported content: present in bundles, never imported.
        import_rules.insert("images", ImportRule::disabled(false));
        import_rules.insert("maps", ImportRule::disabled(false));
        import_rules.insert("screens", ImportRule::disabled(false));
        import_rules.insert("graphs", ImportRule::disabled(true));
        import_rules.insert("templateScreens", ImportRule::disabled(true));
        import_rules.insert("httptests", ImportRule::disabled(true));

        let mut discard_fields = BTreeMap::new();
        discard_fields.insert(
            EntityKind::Host,
            vec!["items", "triggers", "discovery_rules"],
        );
        discard_fields.insert(
            EntityKind::Action,
            vec!["actionid", "operationid", "opcommand_hstid", "opcommand_grpid"],
        );
        discard_fields.insert(
            EntityKind::Proxy,
            vec![
                "interface",
                "lastaccess",
                "version",
                "compatibility",
                "state",
                "auto_compress",
            ],
        );
        discard_fields.insert(EntityKind::DiscoveryRule, vec!["nextcheck"]);

        let auth_ldap_fields = vec![
            "ldap_host",
            "ldap_port",
            "ldap_base_dn",
            "ldap_search_attribute",
            "ldap_bind_dn",
            "ldap_case_sensitive",
            "ldap_bind_password",
            "ldap_userdirectoryid",
            "ldap_jit_status",
            "jit_provision_interval",
        ];
        let auth_saml_fields = vec![
            "saml_idp_entityid",
            "saml_sso_url",
            "saml_slo_url",
            "saml_username_attribute",
            "saml_sp_entityid",
            "saml_nameid_format",
            "saml_sign_messages",
            "saml_sign_assertions",
            "saml_sign_authn_requests",
            "saml_sign_logout_requests",
            "saml_sign_logout_responses",
            "saml_encrypt_nameid",
            "saml_encrypt_assertions",
            "saml_case_sensitive",
            "saml_jit_status",
        ];

        let mut undeletable = BTreeMap::new();
        undeletable.insert(EntityKind::MediaType, vec!["Cloud Email"]);
        let cloud_overrides = CloudOverrides {
            undeletable,
            role_rules: vec!["modules", "modules.default_access"],
            authentication_fields: vec![
                "http_auth_enabled",
                "http_login_form",
                "http_strip_domains",
                "http_case_sensitive",
            ],
        };

        let mut added_in = BTreeMap::new();
        for kind in [
            EntityKind::HostGroup,
            EntityKind::Host,
            EntityKind::Template,
            EntityKind::User,
            EntityKind::UserGroup,
            EntityKind::UserMacroGlobal,
            EntityKind::MediaType,
            EntityKind::Action,
            EntityKind::Maintenance,
            EntityKind::Script,
            EntityKind::ValueMap,
            EntityKind::Proxy,
            EntityKind::DiscoveryRule,
            EntityKind::Correlation,
            EntityKind::Trigger,
        ] {
            added_in.insert(kind, Release::R4_0);
        }

        Profile {
            release,
            methods,
            global: Vec::new(),
            pre: vec![
                EntityKind::UserMacroGlobal,
                EntityKind::MediaType,
                EntityKind::Proxy,
            ],
            mid: vec![EntityKind::Script],
            post: vec![
                EntityKind::Action,
                EntityKind::Maintenance,
                EntityKind::DiscoveryRule,
                EntityKind::Correlation,
            ],
            account: vec![EntityKind::UserGroup, EntityKind::User],
            config_export,
            config_import,
            import_rules,
            added_in,
            discard_fields,
            auth_ldap_fields,
            auth_saml_fields,
            timeout_targets: Vec::new(),
            cloud_overrides,
            id_fields: BTreeMap::new(),
        }
    }

    /// 4.4: autoregistration becomes an API object; media types move from
    /// direct API handling into the configuration bundle and their name
    /// field changes from `description` to `name`.
    fn apply_4_4(&mut self) {
        self.methods.insert(
            EntityKind::Autoregistration,
            MethodSpec {
                id_field: None,
                name_field: None,
                get_options: json!({}),
            },
        );
        self.added_in
            .insert(EntityKind::Autoregistration, Release::R4_4);
        self.global.push(EntityKind::Autoregistration);

        if let Some(spec) = self.methods.get_mut(&EntityKind::MediaType) {
            spec.name_field = Some("name");
            spec.get_options = json!({"output": ["name"]});
        }
        self.pre.retain(|k| *k != EntityKind::MediaType);
        self.config_export.insert(EntityKind::MediaType, "mediaTypes");
        let mut table = BTreeMap::new();
        table.insert("mediaTypes", EntityKind::MediaType);
        self.config_import.insert(Release::R4_4, table);
        self.import_rules
            .insert("mediaTypes", ImportRule::create_update());
    }

    /// 5.0: macros gain a type; only text macros replicate (secret values
    /// cannot be read back and come from configuration instead).
    fn apply_5_0(&mut self) {
        if let Some(spec) = self.methods.get_mut(&EntityKind::UserMacroGlobal) {
            spec.get_options["filter"] = json!({"type": 0});
        }
    }

    /// 5.2: permissions split into roles; vault macros appear.
    fn apply_5_2(&mut self) {
        if let Some(spec) = self.methods.get_mut(&EntityKind::UserMacroGlobal) {
            spec.get_options["filter"] = json!({"type": [0, 2]});
        }
        self.methods.insert(
            EntityKind::Role,
            MethodSpec {
                id_field: Some("roleid"),
                name_field: Some("name"),
                get_options: json!({
                    "output": "extend",
                    "selectRules": "extend",
                }),
            },
        );
        self.added_in.insert(EntityKind::Role, Release::R5_2);
        self.post.push(EntityKind::Role);
        if let Some(spec) = self.methods.get_mut(&EntityKind::User) {
            if let Some(output) = spec.get_options["output"].as_array_mut() {
                output.push(json!("roleid"));
            }
        }
        if let Some(rule) = self.import_rules.remove("templateScreens") {
            self.import_rules.insert("templateDashboards", rule);
        }
        self.discard_fields.insert(EntityKind::Role, vec!["readonly"]);
    }

    /// 5.4: the user name field becomes `username`; value maps embed into
    /// hosts and templates; applications and screens are gone.
    fn apply_5_4(&mut self) {
        if let Some(spec) = self.methods.get_mut(&EntityKind::User) {
            spec.name_field = Some("username");
            spec.get_options["output"] = json!(["username", "roleid"]);
        }
        self.config_export.remove(&EntityKind::ValueMap);
        self.import_rules.remove("applications");
        self.import_rules.remove("screens");
    }

    /// 6.0: global settings, authentication, regular expressions, SLAs and
    /// services become API objects; acknowledge operations are renamed to
    /// update operations.
    fn apply_6_0(&mut self) {
        self.methods.insert(
            EntityKind::Authentication,
            MethodSpec {
                id_field: None,
                name_field: None,
                get_options: json!({}),
            },
        );
        self.methods.insert(
            EntityKind::Settings,
            MethodSpec {
                id_field: None,
                name_field: None,
                get_options: json!({}),
            },
        );
        self.methods.insert(
            EntityKind::Regexp,
            MethodSpec {
                id_field: Some("regexpid"),
                name_field: Some("name"),
                get_options: json!({
                    "output": ["regexpid", "name"],
                    "selectExpressions": [
                        "expression",
                        "expression_type",
                        "exp_delimiter",
                        "case_sensitive",
                    ],
                }),
            },
        );
        self.methods.insert(
            EntityKind::Sla,
            MethodSpec {
                id_field: Some("slaid"),
                name_field: Some("name"),
                get_options: json!({
                    "output": "extend",
                    "selectSchedule": "extend",
                    "selectExcludedDowntimes": "extend",
                    "selectServiceTags": "extend",
                }),
            },
        );
        self.methods.insert(
            EntityKind::Service,
            MethodSpec {
                id_field: Some("serviceid"),
                name_field: Some("name"),
                get_options: json!({
                    "output": "extend",
                    "selectParents": ["name"],
                    "selectChildren": ["name"],
                    "selectStatusRules": "extend",
                    "selectProblemTags": "extend",
                    "selectTags": "extend",
                }),
            },
        );
        for (kind, release) in [
            (EntityKind::Authentication, Release::R6_0),
            (EntityKind::Settings, Release::R6_0),
            (EntityKind::Regexp, Release::R6_0),
            (EntityKind::Sla, Release::R6_0),
            (EntityKind::Service, Release::R6_0),
        ] {
            self.added_in.insert(kind, release);
        }

        if let Some(spec) = self.methods.get_mut(&EntityKind::Action) {
            if let Some(options) = spec.get_options.as_object_mut() {
                if let Some(value) = options.remove("selectAcknowledgeOperations") {
                    options.insert("selectUpdateOperations".into(), value);
                }
            }
        }

        self.global.push(EntityKind::Settings);
        self.global.push(EntityKind::Authentication);
        self.pre.push(EntityKind::Regexp);
        self.post.push(EntityKind::Service);
        self.post.push(EntityKind::Sla);

        self.discard_fields.insert(
            EntityKind::Service,
            vec!["status", "uuid", "created_at", "readonly"],
        );
        self.discard_fields
            .insert(EntityKind::Settings, vec!["ha_failover_delay"]);
        self.discard_fields.insert(
            EntityKind::Sla,
            vec!["service_tags", "schedule", "excluded_downtimes"],
        );
    }

    /// 6.2: groups split between hosts and templates; rights split with
    /// them; the bundle sections rename.
    fn apply_6_2(&mut self) {
        self.methods.insert(
            EntityKind::TemplateGroup,
            MethodSpec {
                id_field: Some("groupid"),
                name_field: Some("name"),
                get_options: json!({"output": "extend"}),
            },
        );
        self.added_in
            .insert(EntityKind::TemplateGroup, Release::R6_2);

        if let Some(spec) = self.methods.get_mut(&EntityKind::Maintenance) {
            if let Some(options) = spec.get_options.as_object_mut() {
                if let Some(value) = options.remove("selectGroups") {
                    options.insert("selectHostGroups".into(), value);
                }
            }
        }
        if let Some(spec) = self.methods.get_mut(&EntityKind::UserGroup) {
            if let Some(options) = spec.get_options.as_object_mut() {
                if let Some(value) = options.remove("selectRights") {
                    options.insert("selectHostGroupRights".into(), value.clone());
                    options.insert("selectTemplateGroupRights".into(), value);
                }
            }
        }

        self.config_export.insert(EntityKind::HostGroup, "host_groups");
        self.config_export
            .insert(EntityKind::TemplateGroup, "template_groups");
        let mut table = BTreeMap::new();
        table.insert("host_groups", EntityKind::HostGroup);
        table.insert("template_groups", EntityKind::TemplateGroup);
        self.config_import.insert(Release::R6_2, table);
        // Standalone value maps only matter when importing pre-6.2 data.
        if let Some(base) = self.config_import.get_mut(&Release::R4_0) {
            base.remove("value_maps");
        }
        if let Some(rule) = self.import_rules.remove("groups") {
            self.import_rules.insert("host_groups", rule);
            self.import_rules.insert("template_groups", rule);
        }
    }

    /// 6.4: LDAP/SAML move into user directories; streaming connectors
    /// appear.
    fn apply_6_4(&mut self) {
        self.methods.insert(
            EntityKind::UserDirectory,
            MethodSpec {
                id_field: Some("userdirectoryid"),
                name_field: Some("name"),
                get_options: json!({
                    "output": "extend",
                    "selectProvisionMedia": "extend",
                    "selectProvisionGroups": "extend",
                }),
            },
        );
        self.methods.insert(
            EntityKind::Connector,
            MethodSpec {
                id_field: Some("connectorid"),
                name_field: Some("name"),
                get_options: json!({"output": "extend"}),
            },
        );
        self.added_in
            .insert(EntityKind::UserDirectory, Release::R6_4);
        self.added_in.insert(EntityKind::Connector, Release::R6_4);
        self.post.push(EntityKind::UserDirectory);
        self.post.push(EntityKind::Connector);

        if let Some(spec) = self.methods.get_mut(&EntityKind::User) {
            if let Some(output) = spec.get_options["output"].as_array_mut() {
                output.push(json!("userdirectoryid"));
            }
        }
        if let Some(fields) = self.discard_fields.get_mut(&EntityKind::Role) {
            fields.push("services.actions");
        }
    }

    /// 7.0: proxies are rebuilt around `operating_mode`, proxy groups and
    /// MFA appear, and item timeouts become per-check-type settings.
    fn apply_7_0(&mut self) {
        self.methods.insert(
            EntityKind::ProxyGroup,
            MethodSpec {
                id_field: Some("proxy_groupid"),
                name_field: Some("name"),
                get_options: json!({
                    "output": [
                        "proxy_groupid",
                        "name",
                        "failover_delay",
                        "min_online",
                        "description",
                    ],
                }),
            },
        );
        self.methods.insert(
            EntityKind::Proxy,
            MethodSpec {
                id_field: Some("proxyid"),
                name_field: Some("name"),
                get_options: json!({"output": "extend"}),
            },
        );
        self.methods.insert(
            EntityKind::Mfa,
            MethodSpec {
                id_field: Some("mfaid"),
                name_field: Some("name"),
                get_options: json!({"output": "extend"}),
            },
        );
        self.added_in.insert(EntityKind::ProxyGroup, Release::R7_0);
        self.added_in.insert(EntityKind::Mfa, Release::R7_0);

        // Proxy groups must exist before the proxies that join them.
        self.pre.retain(|k| *k != EntityKind::Proxy);
        self.pre.push(EntityKind::ProxyGroup);
        self.mid.push(EntityKind::Proxy);
        // MFA methods must exist before authentication references them.
        self.post.push(EntityKind::Mfa);

        self.timeout_targets = vec![
            "simple_check",
            "snmp_agent",
            "external_check",
            "db_monitor",
            "http_agent",
            "ssh_agent",
            "telnet_agent",
            "script",
            "browser",
        ];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_releases() {
        assert!(Profile::for_release(Release { major: 3, minor: 4 }).is_err());
        assert!(Profile::for_release(Release { major: 7, minor: 2 }).is_err());
    }

    #[test]
    fn added_in_bounds_hold_for_every_release() {
        for release in Release::ALL {
            let profile = Profile::for_release(release).unwrap();
            for kind in profile.kinds() {
                let added = profile.added_in(kind).unwrap_or(Release::R4_0);
                assert!(
                    added <= release,
                    "{kind} appears in profile {release} but was added in {added}"
                );
            }
            // Nothing newer than the release leaks in.
            for (kind, added) in profile.added_in.iter() {
                if *added > release {
                    assert!(
                        !profile.has_kind(*kind),
                        "{kind} added in {added} must not exist at {release}"
                    );
                }
            }
        }
    }

    #[test]
    fn profiles_grow_monotonically() {
        let mut previous: Option<Profile> = None;
        for release in Release::ALL {
            let profile = Profile::for_release(release).unwrap();
            if let Some(prev) = &previous {
                for kind in prev.kinds() {
                    assert!(
                        profile.has_kind(kind),
                        "{kind} vanished between {} and {}",
                        prev.release,
                        release
                    );
                }
            }
            previous = Some(profile);
        }
    }

    #[test]
    fn user_name_field_changes_at_5_4() {
        let old = Profile::for_release(Release::R5_2).unwrap();
        assert_eq!(old.name_field(EntityKind::User), Some("alias"));
        let new = Profile::for_release(Release::R5_4).unwrap();
        assert_eq!(new.name_field(EntityKind::User), Some("username"));
    }

    #[test]
    fn acknowledge_operations_rename_at_6_0() {
        let old = Profile::for_release(Release::R5_4).unwrap();
        let options = &old.method(EntityKind::Action).unwrap().get_options;
        assert!(options.get("selectAcknowledgeOperations").is_some());
        let new = Profile::for_release(Release::R6_0).unwrap();
        let options = &new.method(EntityKind::Action).unwrap().get_options;
        assert!(options.get("selectAcknowledgeOperations").is_none());
        assert!(options.get("selectUpdateOperations").is_some());
    }

    #[test]
    fn proxy_moves_from_pre_to_mid_at_7_0() {
        let old = Profile::for_release(Release::R6_4).unwrap();
        assert!(old.section_kinds(Section::Pre).contains(&EntityKind::Proxy));
        let new = Profile::for_release(Release::R7_0).unwrap();
        assert!(!new.section_kinds(Section::Pre).contains(&EntityKind::Proxy));
        assert!(new.section_kinds(Section::Mid).contains(&EntityKind::Proxy));
        assert!(new
            .section_kinds(Section::Pre)
            .contains(&EntityKind::ProxyGroup));
    }

    #[test]
    fn import_sections_merge_by_master_release() {
        let profile = Profile::for_release(Release::R7_0).unwrap();

        let old_master = profile.import_sections_for(Release::R5_0);
        assert_eq!(old_master.get(&EntityKind::HostGroup), Some(&"groups"));
        assert_eq!(old_master.get(&EntityKind::ValueMap), None);

        let new_master = profile.import_sections_for(Release::R6_4);
        assert_eq!(new_master.get(&EntityKind::HostGroup), Some(&"host_groups"));
        assert_eq!(
            new_master.get(&EntityKind::TemplateGroup),
            Some(&"template_groups")
        );
    }

    #[test]
    fn value_maps_import_only_from_pre_6_2_masters() {
        let profile = Profile::for_release(Release::R6_0).unwrap();
        let sections = profile.import_sections_for(Release::R5_0);
        assert_eq!(sections.get(&EntityKind::ValueMap), Some(&"value_maps"));
    }

    #[test]
    fn groupid_prefers_host_group() {
        let profile = Profile::for_release(Release::R7_0).unwrap();
        assert_eq!(
            profile.kind_for_id_field("groupid"),
            Some(EntityKind::HostGroup)
        );
        assert_eq!(
            profile.kind_for_id_field("proxy_groupid"),
            Some(EntityKind::ProxyGroup)
        );
        assert_eq!(profile.kind_for_id_field("hostid"), Some(EntityKind::Host));
        assert_eq!(profile.kind_for_id_field("made_up_id"), None);
    }

    #[test]
    fn timeout_targets_only_at_7_0() {
        assert!(Profile::for_release(Release::R6_4)
            .unwrap()
            .timeout_targets()
            .is_empty());
        assert!(Profile::for_release(Release::R7_0)
            .unwrap()
            .timeout_targets()
            .contains(&"external_check"));
    }
}
