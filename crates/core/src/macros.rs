// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Declarative macros for reducing boilerplate.
//!
//! - [`simple_display!`] — `Display` impl for unit-variant status enums
//! - [`builder!`] — test builder with defaults for a model struct
//! - [`setters!`] — chained setters for a production config struct
//!
//! These cover exactly the shapes used in this workspace: every status enum
//! here is unit-variant, and builders only need `into` (string/path-like)
//! and `set` (plain value) fields.

/// Generate a `Display` impl mapping unit enum variants to string literals.
///
/// ```ignore
/// gantry_core::simple_display! {
///     JobStatus {
///         Starting => "starting",
///         Running => "running",
///     }
/// }
/// ```
#[macro_export]
macro_rules! simple_display {
    ($enum:ty { $( $variant:ident => $str:literal ),+ $(,)? }) => {
        impl std::fmt::Display for $enum {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let name = match self {
                    $( Self::$variant => $str, )+
                };
                f.write_str(name)
            }
        }
    };
}

/// Generate a test builder (struct + Default + setters + `build()`).
///
/// All generated items are gated behind `#[cfg(any(test, feature =
/// "test-support"))]`. Field groups:
/// - `into { field: Type = default }` — setter takes `impl Into<Type>`
/// - `set { field: Type = default }` — setter takes `Type` directly
///
/// ```ignore
/// gantry_core::builder! {
///     pub struct JobBuilder => Job {
///         into { id: String = "host0-testjob" }
///         set { config: JobConfig = JobConfig::default() }
///     }
/// }
/// ```
#[macro_export]
macro_rules! builder {
    (
        pub struct $builder:ident => $target:ident {
            into { $( $into_field:ident : $into_ty:ty = $into_default:expr ),+ $(,)? }
            set { $( $set_field:ident : $set_ty:ty = $set_default:expr ),+ $(,)? }
        }
    ) => {
        #[cfg(any(test, feature = "test-support"))]
        pub struct $builder {
            $( $into_field: $into_ty, )+
            $( $set_field: $set_ty, )+
        }

        #[cfg(any(test, feature = "test-support"))]
        impl $builder {
            $(
                pub fn $into_field(mut self, v: impl Into<$into_ty>) -> Self {
                    self.$into_field = v.into();
                    self
                }
            )+

            $(
                pub fn $set_field(mut self, v: $set_ty) -> Self {
                    self.$set_field = v;
                    self
                }
            )+

            pub fn build(self) -> $target {
                $target {
                    $( $into_field: self.$into_field, )+
                    $( $set_field: self.$set_field, )+
                }
            }
        }

        #[cfg(any(test, feature = "test-support"))]
        impl Default for $builder {
            fn default() -> Self {
                Self {
                    $( $into_field: $into_default.into(), )+
                    $( $set_field: $set_default, )+
                }
            }
        }

        #[cfg(any(test, feature = "test-support"))]
        impl $target {
            /// Builder preloaded with test defaults.
            pub fn builder() -> $builder {
                $builder::default()
            }
        }
    };
}

/// Generate chained setter methods inside an existing `impl` block.
///
/// Field groups work the same as [`builder!`] but carry no defaults and
/// nothing is test-gated.
///
/// ```ignore
/// impl ProcessConfig {
///     gantry_core::setters! {
///         into { id: String, data_dir: PathBuf }
///         set { singleton: bool, port: u16 }
///     }
/// }
/// ```
#[macro_export]
macro_rules! setters {
    (
        into { $( $into_field:ident : $into_ty:ty ),+ $(,)? }
        set { $( $set_field:ident : $set_ty:ty ),+ $(,)? }
    ) => {
        $(
            pub fn $into_field(mut self, v: impl Into<$into_ty>) -> Self {
                self.$into_field = v.into();
                self
            }
        )+

        $(
            pub fn $set_field(mut self, v: $set_ty) -> Self {
                self.$set_field = v;
                self
            }
        )+
    };
}
