// Copyright (c) Weibo Archiver Team
// SPDX-License-Identifier: Apache-2.0

pub mod cards;
pub mod config;
pub mod db;
pub mod error;
pub mod history;
pub mod location;
pub mod media;
pub mod models;
pub mod schema;
pub mod session;
pub mod shortid;
pub mod transcript;
pub mod worker;
