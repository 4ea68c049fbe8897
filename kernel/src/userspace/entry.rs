//! Program entry and exit glue.

use super::{fd, syscall};

/// Run a user program's `main`, then exit with its return code. The boot
/// stub of each user binary jumps here with the argument registers intact.
pub fn libmain(main: fn(i32, *const *const u8) -> i32, argc: i32, argv: *const *const u8) -> ! {
    let code = main(argc, argv);
    exit(code)
}

/// Flush and release every fd, then leave the exit status for `wait`.
pub fn exit(status: i32) -> ! {
    fd::close_all();
    syscall::exit(status)
}
