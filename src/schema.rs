// Copyright (c) Weibo Archiver Team
// SPDX-License-Identifier: Apache-2.0

// Import diesel table macros
use diesel::allow_tables_to_appear_in_same_query;
use diesel::table;

table! {
    authors (id) {
        id -> BigInt,
        screen_name -> Varchar,
        remark -> Nullable<Varchar>,
        gender -> Nullable<Varchar>,
        birthday -> Nullable<Varchar>,
        location -> Nullable<Varchar>,
        hometown -> Nullable<Varchar>,
        description -> Nullable<Text>,
        education -> Nullable<Text>,
        followed_by -> Nullable<Text>,
        avatar_url -> Nullable<Varchar>,
        verified -> Bool,
        following -> Bool,
        follow_me -> Bool,
        followers_count -> Nullable<BigInt>,
        follow_count -> Nullable<BigInt>,
        statuses_count -> Nullable<BigInt>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

table! {
    posts (id) {
        id -> BigInt,
        bid -> Varchar,
        author_id -> BigInt,
        created_at -> Timestamptz,
        text -> Nullable<Text>,
        mentions -> Nullable<Text>,
        hashtags -> Nullable<Text>,
        region_name -> Nullable<Varchar>,
        location_name -> Nullable<Varchar>,
        location_poi -> Nullable<Varchar>,
        latitude -> Nullable<Double>,
        longitude -> Nullable<Double>,
        photos -> Nullable<Text>,
        declared_photo_count -> Nullable<Integer>,
        has_extra_photos -> Bool,
        video_url -> Nullable<Varchar>,
        video_duration -> Nullable<Double>,
        reposts_count -> Nullable<BigInt>,
        comments_count -> Nullable<BigInt>,
        attitudes_count -> Nullable<BigInt>,
        pinned -> Bool,
        edit_count -> Integer,
        source_kind -> Varchar,
        fetched_at -> Timestamptz,
    }
}

table! {
    post_caches (post_id) {
        post_id -> BigInt,
        web_snapshot -> Nullable<Jsonb>,
        mobile_snapshot -> Nullable<Jsonb>,
        weico_snapshot -> Nullable<Jsonb>,
        edit_history -> Nullable<Jsonb>,
        updated_at -> Timestamptz,
    }
}

table! {
    places (poi_id) {
        poi_id -> Varchar,
        name -> Varchar,
        latitude -> Double,
        longitude -> Double,
        address -> Nullable<Varchar>,
        resolved_by -> Varchar,
        created_at -> Timestamptz,
    }
}

table! {
    social_edges (id) {
        id -> Integer,
        subject_id -> BigInt,
        friend_id -> BigInt,
        bi_follow -> Bool,
        gender -> Nullable<Varchar>,
        profile_snapshot -> Nullable<Jsonb>,
        frequency -> Integer,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

table! {
    fetch_cursors (author_id) {
        author_id -> BigInt,
        last_fetched_at -> Nullable<Timestamptz>,
        next_due_at -> Nullable<Timestamptz>,
        enabled -> Bool,
        visit_count -> Integer,
        updated_at -> Timestamptz,
    }
}

// Allow joining the tables if needed
allow_tables_to_appear_in_same_query!(
    authors,
    posts,
    post_caches,
    places,
    social_edges,
    fetch_cursors,
);
