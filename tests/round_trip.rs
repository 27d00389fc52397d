use std::collections::{BTreeMap, HashMap};

use nublado_controller::builder::lab::{LabBuilder, LabStateObjects};
use nublado_controller::config::Config;
use nublado_controller::models::lab::{
    LabRequestOptions, LabSize, LabSpecification, LabStatus, NotebookQuota, UserGroup, UserInfo,
    UserQuota,
};
use nublado_controller::models::rspimage::RspImage;
use nublado_controller::models::rsptag::{RspImageTag, RspImageType};

const CONFIG: &str = r#"
baseUrl: "https://data.example.org"
lab:
  nss:
    basePasswd: "root:x:0:0:root:/root:/bin/bash\n"
    baseGroup: "root:x:0:\n"
  sizes:
    - size: small
      cpu: 1.0
      memory: 2GiB
    - size: medium
      cpu: 2.0
      memory: 4GiB
images:
  source:
    registry: lighthouse.ceres
    repository: library/sketchbook
fileserver:
  enabled: false
"#;

fn test_user() -> UserInfo {
    UserInfo {
        username: "rachel".to_string(),
        name: Some("Rachel (?)".to_string()),
        uid: 1101,
        gid: 1101,
        groups: vec![
            UserGroup { name: "rachel".to_string(), id: Some(1101) },
            UserGroup { name: "lunatics".to_string(), id: Some(2028) },
        ],
        quota: Some(UserQuota {
            api: HashMap::new(),
            notebook: Some(NotebookQuota { cpu: 9.0, memory: 27.0 }),
        }),
    }
}

fn test_spec() -> LabSpecification {
    LabSpecification {
        options: LabRequestOptions {
            image_list: None,
            image_dropdown: None,
            image_class: None,
            image_tag: Some("w_2077_43".to_string()),
            size: LabSize::Medium,
            enable_debug: true,
            reset_user_env: false,
        },
        env: HashMap::from([(
            "JUPYTERHUB_SERVICE_PREFIX".to_string(),
            "/nb/user/rachel/".to_string(),
        )]),
    }
}

/// Parseable tags survive a round trip through their canonical string, and
/// unparseable strings come back as unknown tags displaying themselves.
#[test]
fn test_tag_string_round_trip() {
    let tags = [
        "r21_0_1",
        "r22_0_0_rc1",
        "w_2077_46",
        "d_2077_10_21",
        "d_2077_10_21_c0027.001",
        "r21_0_1_rsp29_extra",
        "exp_w_2021_22",
        "exp_random",
    ];
    for tag in tags {
        let parsed = RspImageTag::from_str(tag);
        assert_eq!(parsed.tag, tag);
        assert_eq!(RspImageTag::from_str(&parsed.tag), parsed, "{tag} round trip");
        assert_ne!(parsed.image_type, RspImageType::Unknown, "{tag} should parse");
    }

    let unknown = RspImageTag::from_str("certainly_not_a_tag");
    assert_eq!(unknown.image_type, RspImageType::Unknown);
    assert_eq!(unknown.display_name, "certainly_not_a_tag");
    assert_eq!(RspImageTag::from_str(&unknown.tag), unknown);
}

/// Building a lab and recreating state from the built objects yields the
/// inputs back: user, options with the image digest, resources, and quota.
#[test]
fn test_build_then_recreate_lab_state() {
    let config = Config::from_yaml(CONFIG).unwrap();
    let builder = LabBuilder::new(config.lab.clone(), &config.base_url);
    let user = test_user();
    let spec = test_spec();
    let image = RspImage::new(
        "lighthouse.ceres",
        "library/sketchbook",
        RspImageTag::from_str("w_2077_43"),
        "sha256:e693782192ecef4f7846ad2b21b1574682e70074746094e29675d559d48d2510",
    );

    let objects = builder
        .build_lab(&user, &spec, &image, BTreeMap::new(), None)
        .unwrap();
    let state_objects = LabStateObjects {
        env_config_map: objects.env_config_map,
        quota: objects.quota,
        pod: objects.pod,
    };
    let state = builder.recreate_lab_state("rachel", Some(&state_objects)).unwrap();

    assert_eq!(state.user.username, user.username);
    assert_eq!(state.user.name, user.name);
    assert_eq!(state.user.uid, user.uid);
    assert_eq!(state.user.gid, user.gid);
    assert_eq!(state.user.groups, user.groups);

    assert_eq!(state.options.image, image.reference_with_digest());
    assert_eq!(state.options.size, LabSize::Medium);
    assert!(state.options.enable_debug);
    assert!(!state.options.reset_user_env);

    let size = config.lab.get_size_definition(LabSize::Medium).unwrap();
    assert_eq!(state.resources, size.to_lab_resources().unwrap());

    let quota = state.quota.unwrap();
    assert_eq!(quota.cpu, 9.0);
    assert_eq!(quota.memory, 27 * (1u64 << 30));

    // A freshly built pod has no status, which reads as a pending lab.
    assert_eq!(state.status, LabStatus::Pending);
    assert_eq!(
        state.internal_url.as_deref(),
        Some("http://lab.userlabs-rachel:8888/nb/user/rachel/")
    );
}
