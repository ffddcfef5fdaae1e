//! Identity resolution: labels, ids, aliases and the COELBA consolidation.

mod common;

use distmetrics_core::{
    dimension::{collect_identities, EntityDirectory},
    identity::{build_distributor_id, compose_label, IdentityRegistry, IdentityResolver},
    overrides::OverrideStore,
    text::UNKNOWN_DISTRIBUTOR,
};

#[test]
fn label_is_short_name_when_legal_is_blank_or_identical() {
    assert_eq!(compose_label("COELBA", ""), "COELBA");
    assert_eq!(compose_label("COELBA", "COELBA"), "COELBA");
    assert_eq!(
        compose_label("COELBA", "Neoenergia Coelba"),
        "COELBA — Neoenergia Coelba"
    );
}

#[test]
fn distributor_id_is_a_pure_function_of_the_raw_pair() {
    let a = build_distributor_id("Neoenergia  Coelba", "ignored");
    let b = build_distributor_id(" NEOENERGIA COELBA ", "other name");
    assert_eq!(a, "neoenergia_coelba");
    assert_eq!(a, b);

    // Blank short code falls back to the legal name.
    assert_eq!(build_distributor_id("", "Cemig Distribuição S.A."), "cemig_distribuicao_s_a");
    assert_eq!(build_distributor_id("", "  "), UNKNOWN_DISTRIBUTOR);
}

#[test]
fn aliases_are_followed_exactly_one_hop() {
    let overrides = OverrideStore::from_json(
        r#"{ "distributor_aliases": { "a": "b", "b": "c" } }"#,
    )
    .expect("parse overrides");
    let resolver = IdentityResolver::new(&overrides);
    assert_eq!(resolver.resolve("A", "").distributor_id, "b");
    assert_eq!(resolver.resolve("B", "").distributor_id, "c");
}

#[test]
fn name_override_replaces_display_names() {
    let overrides = OverrideStore::from_json(
        r#"{ "distributor_name_overrides": {
               "light": { "sigagente": "LIGHT SESA", "nomagente": "" } } }"#,
    )
    .expect("parse overrides");
    let resolved = IdentityResolver::new(&overrides).resolve("LIGHT", "Light Serviços de Eletricidade");
    assert!(resolved.pinned);
    assert_eq!(resolved.name_sig, "LIGHT SESA");
    // Empty override field falls back to the raw value.
    assert_eq!(resolved.name_legal, "Light Serviços de Eletricidade");
    assert_eq!(resolved.label, "LIGHT SESA — Light Serviços de Eletricidade");
}

#[test]
fn name_override_on_short_code_survives_alias_redirect() {
    let overrides = OverrideStore::from_json(
        r#"{
            "distributor_aliases": { "COELBA": "neoenergia_coelba" },
            "distributor_name_overrides": {
                "COELBA": { "sigagente": "NEOENERGIA COELBA", "nomagente": "Neoenergia Coelba" }
            }
        }"#,
    )
    .expect("parse overrides");
    let resolved = IdentityResolver::new(&overrides).resolve("COELBA", "Cia Eletricidade Bahia");
    assert_eq!(resolved.distributor_id, "neoenergia_coelba");
    assert!(resolved.pinned);
    assert_eq!(resolved.name_sig, "NEOENERGIA COELBA");
    assert_eq!(resolved.name_legal, "Neoenergia Coelba");
}

#[test]
fn short_code_override_wins_over_canonical_override() {
    let overrides = OverrideStore::from_json(
        r#"{
            "distributor_aliases": { "coelba": "neoenergia_coelba" },
            "distributor_name_overrides": {
                "coelba": { "sigagente": "FROM SHORT CODE" },
                "neoenergia_coelba": { "sigagente": "FROM CANONICAL" }
            }
        }"#,
    )
    .expect("parse overrides");
    let resolver = IdentityResolver::new(&overrides);
    assert_eq!(resolver.resolve("COELBA", "").name_sig, "FROM SHORT CODE");
    // Rows already spelled with the canonical code still get the canonical override.
    assert_eq!(resolver.resolve("NEOENERGIA COELBA", "").name_sig, "FROM CANONICAL");
}

#[test]
fn coelba_spellings_resolve_to_one_neoenergia_distributor() {
    let overrides = common::fixture_overrides();
    let resolver = IdentityResolver::new(&overrides);

    let short = resolver.resolve("NEOENERGIA COELBA", "");
    let legal = resolver.resolve("COELBA", "Neoenergia Coelba Distribuição S.A.");
    assert_eq!(short.distributor_id, "neoenergia_coelba");
    assert_eq!(legal.distributor_id, short.distributor_id);

    let corpus = common::fixture_corpus();
    let registry = collect_identities(&overrides, &corpus);
    let directory = EntityDirectory::build(&overrides, &registry);
    let entry = directory
        .lookup("COELBA", "Neoenergia Coelba Distribuição S.A.")
        .expect("COELBA is registered");
    assert_eq!(entry.identity.distributor_id, "neoenergia_coelba");
    assert_eq!(entry.group_id, "neoenergia");
    assert_eq!(entry.group_label, "Neoenergia");
}

#[test]
fn registry_keeps_the_most_frequent_spelling() {
    let overrides = OverrideStore::empty();
    let resolver = IdentityResolver::new(&overrides);
    let mut registry = IdentityRegistry::new();
    for (sig, name) in [
        ("ENEL CE", "Enel Distribuição Ceará"),
        ("ENEL CE", "Enel Distribuição Ceará"),
        ("ENEL CE", "ENEL DISTRIBUICAO CEARA"),
    ] {
        registry.observe(&resolver.resolve(sig, name));
    }
    assert_eq!(registry.len(), 1);

    let identities = registry.finalize();
    let enel = identities.get("enel_ce").expect("enel_ce consolidated");
    assert_eq!(enel.name_legal, "Enel Distribuição Ceará");
    assert_eq!(enel.label, "ENEL CE — Enel Distribuição Ceará");
}

#[test]
fn every_fixture_row_lands_on_a_registered_id() {
    let overrides = common::fixture_overrides();
    let corpus = common::fixture_corpus();
    let registry = collect_identities(&overrides, &corpus);
    let directory = EntityDirectory::build(&overrides, &registry);

    assert_eq!(directory.len(), 4, "coelba, cpfl paulista, cpfl piratininga, cemig");
    for row in &corpus.services.rows {
        assert!(
            directory.lookup(&row.sigagente, &row.nomagente).is_some(),
            "service row for {} not registered",
            row.sigagente
        );
    }
}
