use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, IntCounter, IntCounterVec, IntGauge, Registry,
};

lazy_static! {
    pub static ref PEG_REGISTRY: Registry =
        Registry::new_custom(Some("peg".to_string()), None).unwrap();
}

lazy_static! {
    pub static ref BTC_TX_REGISTRATIONS: IntCounterVec = register_int_counter_vec_with_registry!(
        "btc_tx_registrations_total",
        "Bitcoin transactions registered, labeled by outcome",
        &["outcome"],
        PEG_REGISTRY
    )
    .unwrap();
    pub static ref FLYOVER_REGISTRATIONS: IntCounterVec = register_int_counter_vec_with_registry!(
        "flyover_registrations_total",
        "Flyover deposit registrations, labeled by outcome",
        &["outcome"],
        PEG_REGISTRY
    )
    .unwrap();
    pub static ref RELEASE_SIGNATURES: IntCounterVec = register_int_counter_vec_with_registry!(
        "release_signatures_total",
        "Federator signature contributions, labeled by status",
        &["status"],
        PEG_REGISTRY
    )
    .unwrap();
    pub static ref RELEASES_FINALIZED: IntCounter = register_int_counter_with_registry!(
        "releases_finalized_total",
        "Outbound transactions that reached the signing quorum",
        PEG_REGISTRY
    )
    .unwrap();
    pub static ref PEGOUT_TXS_CREATED: IntCounterVec = register_int_counter_vec_with_registry!(
        "pegout_transactions_created_total",
        "Outbound bitcoin transactions built, labeled by kind",
        &["kind"],
        PEG_REGISTRY
    )
    .unwrap();
    pub static ref SVP_TRANSITIONS: IntCounterVec = register_int_counter_vec_with_registry!(
        "svp_transitions_total",
        "Proposed federation validation transitions",
        &["transition"],
        PEG_REGISTRY
    )
    .unwrap();
    pub static ref CUSTODIED_BALANCE: IntGauge = register_int_gauge_with_registry!(
        "custodied_balance_sats",
        "Sats held by the federations on behalf of the sidechain",
        PEG_REGISTRY
    )
    .unwrap();
}
