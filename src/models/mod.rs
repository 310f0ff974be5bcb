// Copyright (c) Weibo Archiver Team
// SPDX-License-Identifier: Apache-2.0

pub mod author;
pub mod cursor;
pub mod edge;
pub mod merge;
pub mod place;
pub mod post;
