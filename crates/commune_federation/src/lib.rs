/*
 * SPDX-FileCopyrightText: 2026 Commune Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod actor;
pub mod delivery;
pub mod fetch;
pub mod group_follow;
pub mod http_retry;
pub mod replies;
pub mod store;
