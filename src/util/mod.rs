// Copyright 2025 Txtrace Project Authors. Licensed under Apache-2.0.

pub(crate) mod guard;
