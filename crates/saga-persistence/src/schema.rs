//! Esquema Diesel escrito a mano; debe coincidir con `migrations/`.

diesel::table! {
    saga_machine_inst (id) {
        id -> Text,
        machine_name -> Text,
        tenant_id -> Text,
        parent_id -> Nullable<Text>,
        definition_hash -> Text,
        business_key -> Nullable<Text>,
        status -> Text,
        compensation_status -> Nullable<Text>,
        is_running -> Bool,
        start_params -> Jsonb,
        end_params -> Nullable<Jsonb>,
        error -> Nullable<Jsonb>,
        started_at -> Timestamptz,
        updated_at -> Timestamptz,
        ended_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    saga_state_inst (id) {
        id -> Text,
        machine_inst_id -> Text,
        seq -> BigInt,
        name -> Text,
        state_type -> Text,
        scope -> Jsonb,
        status -> Text,
        business_key -> Nullable<Text>,
        input -> Jsonb,
        output -> Nullable<Jsonb>,
        error -> Nullable<Jsonb>,
        for_update -> Bool,
        is_for_compensation -> Bool,
        compensated_state_id -> Nullable<Text>,
        retried_state_id -> Nullable<Text>,
        sub_instance_id -> Nullable<Text>,
        attempts -> Integer,
        started_at -> Timestamptz,
        updated_at -> Timestamptz,
        ended_at -> Nullable<Timestamptz>,
        end_seq -> Nullable<BigInt>,
    }
}

diesel::joinable!(saga_state_inst -> saga_machine_inst (machine_inst_id));

diesel::allow_tables_to_appear_in_same_query!(saga_machine_inst, saga_state_inst,);
