//! Unit tests for payload rendering.

use super::*;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rstest::{fixture, rstest};
use serde_json::json;

#[fixture]
fn canary() -> Canary {
    Canary::generate(&mut StdRng::seed_from_u64(3))
}

fn config() -> Map<String, Value> {
    json!({"id": "web.example.com", "master": "salt.example.com"})
        .as_object()
        .cloned()
        .expect("literal is an object")
}

#[rstest]
fn render_replaces_every_placeholder() {
    let rendered = render("a={{ a }} b={{b}}", &[("a", "1"), ("b", "2")]).expect("render");
    assert_eq!(rendered, "a=1 b=2");
}

#[rstest]
fn render_rejects_unknown_variables() {
    let err = render("x={{missing}}", &[("a", "1")]).expect_err("unknown variable");
    assert_eq!(
        err,
        BootstrapError::UnknownVariable {
            name: String::from("missing")
        }
    );
    assert_eq!(
        err.to_string(),
        "bootstrap template references unknown variable {{missing}}"
    );
}

#[rstest]
fn render_rejects_unterminated_placeholders() {
    let err = render("x={{oops", &[]).expect_err("unterminated");
    assert_eq!(err, BootstrapError::Unterminated);
}

#[rstest]
fn values_containing_braces_are_not_reexpanded() {
    let rendered = render("{{a}}", &[("a", "{{b}}")]).expect("render");
    assert_eq!(rendered, "{{b}}");
}

#[rstest]
fn minion_payload_embeds_canary_config_and_master_key(canary: Canary) {
    let config = config();
    let inputs = PayloadInputs {
        canary: &canary,
        minion_config: &config,
        salt_branch: "latest",
        release: DebianRelease::Bookworm,
    };

    let payload = minion_payload(&inputs, "-----BEGIN PUBLIC KEY-----\nABC\n").expect("payload");

    assert!(payload.starts_with("#!/bin/bash"));
    assert!(payload.contains(&format!("printf '%s' '{}'", canary.as_str())));
    assert!(payload.contains("\"master\": \"salt.example.com\""));
    assert!(payload.contains("-----BEGIN PUBLIC KEY-----\nABC\nHART_MASTER_KEY"));
    assert!(payload.contains("bootstrap-salt.sh stable\n"));
    assert!(payload.contains(COMPLETE_SENTINEL));
    assert!(!payload.contains("{{"));
}

#[rstest]
fn master_payload_pins_salt_version(canary: Canary) {
    let config = config();
    let inputs = PayloadInputs {
        canary: &canary,
        minion_config: &config,
        salt_branch: "3006",
        release: DebianRelease::Bullseye,
    };

    let payload = master_payload(&inputs).expect("payload");

    assert!(payload.contains("bootstrap-salt.sh -X stable 3006"));
    assert!(payload.contains("(bullseye)"));
    assert!(!payload.contains("master_pubkey"));
}

#[rstest]
#[case("stretch", DebianRelease::Stretch, 9)]
#[case("bookworm", DebianRelease::Bookworm, 12)]
#[case(" trixie ", DebianRelease::Trixie, 13)]
fn parses_debian_codenames(
    #[case] raw: &str,
    #[case] expected: DebianRelease,
    #[case] version: u8,
) {
    let release: DebianRelease = raw.parse().expect("known codename");
    assert_eq!(release, expected);
    assert_eq!(release.version(), version);
}

#[rstest]
fn unknown_codename_lists_valid_ones() {
    let err = "jessie".parse::<DebianRelease>().expect_err("unknown");
    assert!(err.contains("stretch, buster, bullseye, bookworm, trixie"), "{err}");
}

#[rstest]
fn master_minion_config_layers_extra_and_grains() {
    let extra = json!({"state_verbose": true, "grains": {"env": "prod"}})
        .as_object()
        .cloned()
        .expect("literal is an object");
    let grains = json!({"team": "infra"})
        .as_object()
        .cloned()
        .expect("literal is an object");

    let config = master_minion_config("salt.example.com", Some(extra), Some(grains));

    assert_eq!(config["id"], "salt.example.com");
    assert_eq!(config["user"], "saltmaster");
    assert_eq!(config["file_client"], "local");
    assert_eq!(config["state_verbose"], true);
    assert_eq!(config["grains"], json!({"env": "prod", "team": "infra"}));
}
