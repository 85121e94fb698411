mod clock;
mod timer;

#[cfg(test)]
mod test_utils;

pub(crate) use timer::TimerEvent;
pub(crate) use timer::TimerHandle;
