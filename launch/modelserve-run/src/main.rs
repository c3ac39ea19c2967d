// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use modelserve_model::ModelRegistry;

fn main() -> anyhow::Result<()> {
    modelserve_run::main_with(ModelRegistry::with_builtin())
}
