table! {
    source_checkpoints (source_id) {
        source_id -> Varchar,
        last_processed_block -> Int8,
        last_processed_ref -> Varchar,
        updated_at -> Timestamp,
    }
}

table! {
    raw_event_facts (tx_ref, log_index) {
        tx_ref -> Varchar,
        log_index -> Int4,
        source_id -> Varchar,
        block_number -> Int8,
        event_name -> Varchar,
        decoded_args -> Jsonb,
    }
}

table! {
    revenue_epochs (epoch_id) {
        epoch_id -> Int8,
        total_revenue -> Numeric,
        opc_amount -> Nullable<Numeric>,
        alpha_amount -> Nullable<Numeric>,
        beta_amount -> Nullable<Numeric>,
        gamma_amount -> Nullable<Numeric>,
        delta_amount -> Nullable<Numeric>,
        remainder -> Nullable<Numeric>,
        source_block -> Int8,
        source_time -> Timestamp,
        tx_ref -> Varchar,
    }
}

table! {
    machine_revenues (epoch_id, machine_id) {
        epoch_id -> Int8,
        machine_id -> Varchar,
        amount -> Numeric,
    }
}

table! {
    staking_snapshots (epoch_id, account) {
        epoch_id -> Int8,
        account -> Varchar,
        principal -> Numeric,
        lock_weight -> Numeric,
        effective_weight -> Numeric,
        lock_until -> Nullable<Timestamp>,
        created_block -> Int8,
        created_log_index -> Int4,
    }
}

table! {
    ownership_snapshots (epoch_id, account, asset_id) {
        epoch_id -> Int8,
        account -> Varchar,
        asset_id -> Varchar,
        share_basis_points -> Int4,
        units_held -> Numeric,
        effective_share -> Numeric,
        created_block -> Int8,
        created_log_index -> Int4,
    }
}

table! {
    machine_holder_snapshots (epoch_id, machine_id) {
        epoch_id -> Int8,
        account -> Varchar,
        machine_id -> Varchar,
        revenue_weight -> Numeric,
        created_block -> Int8,
        created_log_index -> Int4,
    }
}

table! {
    merkle_commitments (epoch_id, group_name) {
        epoch_id -> Int8,
        group_name -> Varchar,
        root_hash -> Varchar,
        total_amount -> Numeric,
        leaf_count -> Int4,
        published -> Bool,
        publish_ref -> Nullable<Varchar>,
        submitted_at -> Nullable<Timestamp>,
        published_at -> Nullable<Timestamp>,
    }
}

table! {
    claim_entries (epoch_id, group_name, account) {
        epoch_id -> Int8,
        group_name -> Varchar,
        account -> Varchar,
        amount -> Numeric,
        leaf_hash -> Varchar,
        proof -> Jsonb,
        claimed -> Bool,
        claim_ref -> Nullable<Varchar>,
        claimed_at -> Nullable<Timestamp>,
    }
}

allow_tables_to_appear_in_same_query!(
    source_checkpoints,
    raw_event_facts,
    revenue_epochs,
    machine_revenues,
    staking_snapshots,
    ownership_snapshots,
    machine_holder_snapshots,
    merkle_commitments,
    claim_entries,
);
