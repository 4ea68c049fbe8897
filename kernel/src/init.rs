//! Kernel bring-up.
//!
//! The boot stub enters `kernel_init` with the YAMON argument convention;
//! only `ram_low_size` is consumed. The user images are embedded by the
//! image build and handed in as byte slices.

use crate::arch;
use crate::env;
use crate::mm;
use crate::sched;

/// Memory and table bring-up shared by the real boot path and test boots:
/// heap, RAM detection, the Env table (boot-allocated), the frame table,
/// and the template directory with the user-visible windows.
pub fn boot_common(ram_low_size: usize) {
    mm::heap::init();
    mm::frame::detect_memory(ram_low_size);
    env::init();
    mm::frame::init();
    mm::init(env::table_region()).expect("window setup cannot fail at boot");
}

/// Boot entry: bring the kernel up, launch the first user Env and the file
/// server, and drop into the scheduler.
pub fn kernel_init(ram_low_size: usize, init_image: &[u8], fs_image: &[u8]) -> ! {
    crate::println!("mos: kernel_init");
    crate::logger::init();
    boot_common(ram_low_size);
    arch::timer::init();

    env::create(init_image, 1).expect("init program must load");
    env::create(fs_image, 1).expect("file server must load");

    match sched::schedule(false) {
        Some(first) => sched::run(first),
        None => panic!("kernel_init: nothing to schedule"),
    }
}
