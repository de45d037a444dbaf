//! `SSH_ASKPASS` helper mode.
//!
//! When ssh needs a password it runs the program named by `SSH_ASKPASS` and
//! reads the answer from its stdout. The daemon points `SSH_ASKPASS` at its
//! own executable and passes the secret in [`ASKPASS_SECRET_ENV`]; `main`
//! calls [`run_if_requested`] before anything else so that invocation prints
//! the secret and exits.

use std::io::Write;

/// Environment variable carrying the password to an askpass invocation.
pub const ASKPASS_SECRET_ENV: &str = "TABSHELL_ASKPASS_SECRET";

/// Answers an askpass prompt if this process was started as the helper.
///
/// Returns `true` when the secret was written and the caller should exit.
pub fn run_if_requested() -> bool {
    match std::env::var(ASKPASS_SECRET_ENV) {
        Ok(secret) => {
            let mut stdout = std::io::stdout().lock();
            let _ = writeln!(stdout, "{}", secret);
            let _ = stdout.flush();
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_not_requested_without_secret() {
        std::env::remove_var(ASKPASS_SECRET_ENV);
        assert!(!run_if_requested());
    }

    #[test]
    #[serial]
    fn test_requested_with_secret() {
        std::env::set_var(ASKPASS_SECRET_ENV, "hunter2");
        assert!(run_if_requested());
        std::env::remove_var(ASKPASS_SECRET_ENV);
    }
}
