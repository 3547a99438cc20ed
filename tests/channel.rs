//! Pipeline fan-out over an unbuffered channel: ten consumers each pop
//! once, the producer pushes 0..9, and every consumer observes a
//! distinct value.

use std::cell::RefCell;
use std::rc::Rc;

use cat::sync::Channel;

#[test]
fn ten_consumers_each_see_a_distinct_value() {
    let ch: Channel<i32> = Channel::new(0);
    let seen = Rc::new(RefCell::new(Vec::new()));

    for _ in 0..10 {
        let ch = ch.clone();
        let seen = seen.clone();
        cat::spawn(move || {
            let value = ch.pop(-1).unwrap();
            seen.borrow_mut().push(value);
        });
    }

    cat::spawn(move || {
        for i in 0..10 {
            ch.push(i, -1).unwrap();
        }
    });

    cat::wait_all();

    let mut values = seen.borrow().clone();
    values.sort_unstable();
    assert_eq!(values, (0..10).collect::<Vec<i32>>());
}
