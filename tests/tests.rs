// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

mod async_map;
mod engine;
mod value;
