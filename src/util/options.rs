//! Mount options.
//!
//! Options are typed and validated. They can be set from `PMLFS_*`
//! environment variables or from a bulk mount-option string of
//! comma/space separated `key=value` pairs (a bare key is shorthand for
//! `key=true`).

use std::default::Default;
use std::fmt::Debug;

fn always_valid<T>(_: &T) -> bool {
    true
}

/// An option of a given type, with its validator.
#[derive(Clone)]
pub struct PmlfsOption<T: Debug + Clone> {
    /// The actual value for the option
    value: T,
    /// The validator to ensure the value is valid.
    validator: fn(&T) -> bool,
}

impl<T: Debug + Clone> PmlfsOption<T> {
    pub fn new(value: T, validator: fn(&T) -> bool) -> Self {
        PmlfsOption { value, validator }
    }

    /// Set the option to the given value. Returns true if the value is
    /// valid, and we set the option to the value.
    pub fn set(&mut self, value: T) -> bool {
        if (self.validator)(&value) {
            self.value = value;
            return true;
        }
        false
    }
}

// Dereference an option to get its value.
impl<T: Debug + Clone> std::ops::Deref for PmlfsOption<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

macro_rules! options {
    ($($(#[$outer:meta])*$name:ident: $type:ty [$validator:expr] = $default:expr),*,) => [
        options!($($(#[$outer])*$name: $type [$validator] = $default),*);
    ];
    ($($(#[$outer:meta])*$name:ident: $type:ty [$validator:expr] = $default:expr),*) => [
        /// The set of mount options.
        #[derive(Clone)]
        pub struct Options {
            $($(#[$outer])* pub $name: PmlfsOption<$type>),*
        }

        impl Options {
            /// Set an option and run its validator on the value.
            fn set_inner(&mut self, s: &str, val: &str) -> bool {
                match s {
                    $(stringify!($name) => if let Ok(typed_val) = val.parse::<$type>() {
                        let is_set = self.$name.set(typed_val);
                        if !is_set {
                            eprintln!("Warn: unable to set {}={:?}. Invalid value. Default value will be used.", s, val);
                        }
                        is_set
                    } else {
                        eprintln!("Warn: unable to set {}={:?}. Can't parse value. Default value will be used.", s, val);
                        false
                    },)*
                    _ => {
                        eprintln!("Warn: unknown option {}.", s);
                        false
                    }
                }
            }

            /// Create an `Options` instance with built-in default settings.
            fn new() -> Self {
                Options {
                    $($name: PmlfsOption::new($default, $validator)),*
                }
            }

            /// Read options from environment variables and apply them.
            ///
            /// Environment variables that start with `PMLFS_` and match an
            /// option name (such as `PMLFS_MNT_CP_VERSION`) set the option.
            pub fn read_env_var_settings(&mut self) {
                const PREFIX: &str = "PMLFS_";
                for (key, val) in std::env::vars() {
                    if let Some(rest_of_key) = key.strip_prefix(PREFIX) {
                        let lowercase: &str = &rest_of_key.to_lowercase();
                        match lowercase {
                            $(stringify!($name) => { self.set_inner(lowercase, &val); },)*
                            _ => {}
                        }
                    }
                }
            }

            /// Bulk process a mount-option string. Returns true if every
            /// option was processed successfully.
            ///
            /// Arguments:
            /// * `options`: key=value pairs separated by commas or white
            ///   space, e.g. `mnt_cp_version=3,posix_acl`.
            pub fn set_bulk_from_str(&mut self, options: &str) -> bool {
                for opt in options.replace(',', " ").split_ascii_whitespace() {
                    let ok = match opt.split_once('=') {
                        Some((key, val)) => self.set_inner(key, val),
                        // A bare flag is shorthand for `flag=true`.
                        None => self.set_inner(opt, "true"),
                    };
                    if !ok {
                        return false;
                    }
                }
                true
            }
        }
    ]
}

options! {
    /// Mount this historical checkpoint version read-only. 0 mounts the head.
    mnt_cp_version:  u32   [always_valid] = 0,
    /// Force a read-only mount.
    read_only:       bool  [always_valid] = false,
    /// Enable the external POSIX ACL module. The core only records the flag.
    posix_acl:       bool  [always_valid] = false,
    /// Run the background GC worker.
    bg_gc:           bool  [always_valid] = true,
    /// Background GC sleep bounds, milliseconds.
    gc_min_sleep_ms: u64   [|v| *v > 0] = 3000,
    gc_max_sleep_ms: u64   [|v| *v > 0] = 6000,
    /// Background GC sleep when there is nothing worth collecting.
    gc_nogc_sleep_ms: u64  [|v| *v > 0] = 30000,
}

impl Default for Options {
    fn default() -> Self {
        let mut options = Options::new();
        options.read_env_var_settings();
        options
    }
}
