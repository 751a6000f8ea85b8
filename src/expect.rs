//! Outcome helpers behind the `expect_*!` macros.
//!
//! Every helper takes a [`CapturedCall`], i.e. the return value and errno of the
//! probed operation, classifies it, reports `TFAIL` with a derived message when the
//! expectation does not hold and, unless it is a `_silent` flavour, `TPASS`
//! otherwise. The classification is handed back as an [`Outcome`], which also
//! keeps whatever the call returned so it can be used afterwards.

use std::{
    ffi::c_void,
    fmt::Display,
    fs::File,
    io,
    os::fd::{AsRawFd, OwnedFd},
};

use nix::{errno::Errno, unistd::Pid};

use crate::{
    errno::ErrnoSet,
    result::{Report, ResultKind, SourceLocation},
};

/// Return value and errno of a probed operation.
#[derive(Debug)]
pub struct CapturedCall<T> {
    /// Return value, `-1` when the operation reported an error.
    pub ret: i64,
    /// errno right after the call, or the error carried by the result.
    pub errno: i32,
    /// What the operation returned, if it succeeded.
    pub value: Option<T>,
}

/// Run `call` with errno cleared and capture its outcome.
///
/// errno is read immediately after `call` returns, before anything else can
/// clobber it.
pub fn capture<R: IntoCaptured>(call: impl FnOnce() -> R) -> CapturedCall<R::Value> {
    Errno::clear();
    let result = call();
    let errno = Errno::last_raw();

    result.into_captured(errno)
}

/// Values which have a meaningful numeric return value.
pub trait ReturnValue {
    fn ret(&self) -> i64;
}

impl ReturnValue for () {
    fn ret(&self) -> i64 {
        0
    }
}

macro_rules! return_value_int {
    ($($ty: ty),+) => {
        $(impl ReturnValue for $ty {
            fn ret(&self) -> i64 {
                i64::from(*self)
            }
        })+
    };
}

return_value_int!(i8, i16, i32, i64, u8, u16, u32);

impl ReturnValue for isize {
    fn ret(&self) -> i64 {
        *self as i64
    }
}

impl ReturnValue for usize {
    fn ret(&self) -> i64 {
        i64::try_from(*self).unwrap_or(i64::MAX)
    }
}

impl ReturnValue for Pid {
    fn ret(&self) -> i64 {
        self.as_raw().into()
    }
}

impl ReturnValue for OwnedFd {
    fn ret(&self) -> i64 {
        self.as_raw_fd().into()
    }
}

impl ReturnValue for File {
    fn ret(&self) -> i64 {
        self.as_raw_fd().into()
    }
}

impl<T> ReturnValue for *mut T {
    fn ret(&self) -> i64 {
        *self as isize as i64
    }
}

impl<T> ReturnValue for *const T {
    fn ret(&self) -> i64 {
        *self as isize as i64
    }
}

/// Results of probed operations which can be captured.
pub trait IntoCaptured {
    type Value;

    /// Convert into a [`CapturedCall`], `errno` being the value read right after the call.
    fn into_captured(self, errno: i32) -> CapturedCall<Self::Value>;
}

impl<T: ReturnValue> IntoCaptured for nix::Result<T> {
    type Value = T;

    fn into_captured(self, errno: i32) -> CapturedCall<T> {
        match self {
            Ok(value) => CapturedCall {
                ret: value.ret(),
                errno,
                value: Some(value),
            },
            Err(err) => CapturedCall {
                ret: -1,
                errno: err as i32,
                value: None,
            },
        }
    }
}

impl<T: ReturnValue> IntoCaptured for io::Result<T> {
    type Value = T;

    fn into_captured(self, errno: i32) -> CapturedCall<T> {
        match self {
            Ok(value) => CapturedCall {
                ret: value.ret(),
                errno,
                value: Some(value),
            },
            Err(err) => CapturedCall {
                ret: -1,
                errno: err.raw_os_error().unwrap_or(errno),
                value: None,
            },
        }
    }
}

macro_rules! into_captured_raw {
    ($($ty: ty),+) => {
        $(impl IntoCaptured for $ty {
            type Value = $ty;

            fn into_captured(self, errno: i32) -> CapturedCall<$ty> {
                CapturedCall {
                    ret: self.ret(),
                    errno,
                    value: Some(self),
                }
            }
        })+
    };
}

into_captured_raw!(i32, i64, isize);

impl IntoCaptured for *mut c_void {
    type Value = *mut c_void;

    fn into_captured(self, errno: i32) -> CapturedCall<*mut c_void> {
        CapturedCall {
            ret: self.ret(),
            errno,
            value: Some(self),
        }
    }
}

/// Classified result of an outcome helper.
#[derive(Debug)]
pub struct Outcome<T> {
    pub passed: bool,
    pub ret: i64,
    pub errno: i32,
    pub value: Option<T>,
}

impl<T> Outcome<T> {
    fn new(passed: bool, call: CapturedCall<T>) -> Self {
        Self {
            passed,
            ret: call.ret,
            errno: call.errno,
            value: call.value,
        }
    }

    /// The returned value, only if the expectation held.
    pub fn into_value(self) -> Option<T> {
        if self.passed {
            self.value
        } else {
            None
        }
    }
}

/// Return values the probed operation signals success with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Success {
    /// Only `0`, e.g. `close`.
    Zero,
    /// Any non-negative value, e.g. `open` or `read`.
    NonNegative,
}

impl Success {
    fn matches(self, ret: i64) -> bool {
        match self {
            Success::Zero => ret == 0,
            Success::NonNegative => ret >= 0,
        }
    }
}

/// Sentinel a pointer-returning operation signals failure with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPtr {
    Null,
    /// `(void *) -1`, i.e. `MAP_FAILED`.
    Void,
}

impl FailPtr {
    fn matches(self, ret: i64) -> bool {
        match self {
            FailPtr::Null => ret == 0,
            FailPtr::Void => ret == -1,
        }
    }
}

fn report_fail(
    ctx: &impl Report,
    location: SourceLocation,
    errno: i32,
    message: impl Display,
) {
    ctx.reporter()
        .report(ResultKind::Fail.with_errno(errno), location, message)
}

fn report_pass(ctx: &impl Report, location: SourceLocation, message: impl Display) {
    ctx.reporter().report(ResultKind::Pass, location, message)
}

/// Expect a non-negative return value.
pub fn positive_silent<T>(
    ctx: &impl Report,
    location: SourceLocation,
    msg: impl Display,
    call: CapturedCall<T>,
) -> Outcome<T> {
    match call.ret {
        -1 => report_fail(ctx, location, call.errno, format_args!("{msg} failed")),
        ret if ret < 0 => report_fail(
            ctx,
            location,
            call.errno,
            format_args!("{msg} invalid retval {ret}"),
        ),
        _ => return Outcome::new(true, call),
    }

    Outcome::new(false, call)
}

fn positive_with<T>(
    ctx: &impl Report,
    location: SourceLocation,
    msg: impl Display,
    call: CapturedCall<T>,
    what: &str,
) -> Outcome<T> {
    let outcome = positive_silent(ctx, location.clone(), &msg, call);
    if outcome.passed {
        report_pass(ctx, location, format_args!("{msg} returned {what}{}", outcome.ret));
    }

    outcome
}

/// Expect a non-negative return value and report it.
pub fn positive<T>(
    ctx: &impl Report,
    location: SourceLocation,
    msg: impl Display,
    call: CapturedCall<T>,
) -> Outcome<T> {
    positive_with(ctx, location, msg, call, "")
}

/// Expect a file descriptor.
pub fn fd<T>(
    ctx: &impl Report,
    location: SourceLocation,
    msg: impl Display,
    call: CapturedCall<T>,
) -> Outcome<T> {
    positive_with(ctx, location, msg, call, "fd ")
}

pub fn fd_silent<T>(
    ctx: &impl Report,
    location: SourceLocation,
    msg: impl Display,
    call: CapturedCall<T>,
) -> Outcome<T> {
    positive_silent(ctx, location, msg, call)
}

/// Expect a process id.
pub fn pid<T>(
    ctx: &impl Report,
    location: SourceLocation,
    msg: impl Display,
    call: CapturedCall<T>,
) -> Outcome<T> {
    positive_with(ctx, location, msg, call, "pid ")
}

pub fn pid_silent<T>(
    ctx: &impl Report,
    location: SourceLocation,
    msg: impl Display,
    call: CapturedCall<T>,
) -> Outcome<T> {
    positive_silent(ctx, location, msg, call)
}

/// Expect exactly `expected` as return value.
pub fn val_silent<T>(
    ctx: &impl Report,
    location: SourceLocation,
    msg: impl Display,
    call: CapturedCall<T>,
    expected: i64,
) -> Outcome<T> {
    if call.ret != expected {
        report_fail(
            ctx,
            location,
            call.errno,
            format_args!("{msg} retval {} != {expected}", call.ret),
        );
        return Outcome::new(false, call);
    }

    Outcome::new(true, call)
}

pub fn val<T>(
    ctx: &impl Report,
    location: SourceLocation,
    msg: impl Display,
    call: CapturedCall<T>,
    expected: i64,
) -> Outcome<T> {
    let outcome = val_silent(ctx, location.clone(), &msg, call, expected);
    if outcome.passed {
        report_pass(ctx, location, format_args!("{msg} passed"));
    }

    outcome
}

/// Expect `0` as return value.
pub fn pass_silent<T>(
    ctx: &impl Report,
    location: SourceLocation,
    msg: impl Display,
    call: CapturedCall<T>,
) -> Outcome<T> {
    match call.ret {
        0 => return Outcome::new(true, call),
        -1 => report_fail(ctx, location, call.errno, format_args!("{msg} failed")),
        ret => report_fail(
            ctx,
            location,
            call.errno,
            format_args!("{msg} invalid retval {ret}"),
        ),
    }

    Outcome::new(false, call)
}

pub fn pass<T>(
    ctx: &impl Report,
    location: SourceLocation,
    msg: impl Display,
    call: CapturedCall<T>,
) -> Outcome<T> {
    let outcome = pass_silent(ctx, location.clone(), &msg, call);
    if outcome.passed {
        report_pass(ctx, location, format_args!("{msg} passed"));
    }

    outcome
}

/// Expect the operation to fail with one of `errnos`.
///
/// `success` tells which return values mean the operation unexpectedly succeeded.
pub fn fail_silent<T>(
    ctx: &impl Report,
    location: SourceLocation,
    msg: impl Display,
    call: CapturedCall<T>,
    errnos: &ErrnoSet<'_>,
    success: Success,
) -> Outcome<T> {
    if success.matches(call.ret) {
        ctx.reporter()
            .report(ResultKind::Fail, location, format_args!("{msg} succeeded"));
    } else if call.ret != -1 {
        report_fail(
            ctx,
            location,
            call.errno,
            format_args!("{msg} invalid retval {}", call.ret),
        );
    } else if errnos.contains(call.errno) {
        return Outcome::new(true, call);
    } else {
        report_fail(
            ctx,
            location,
            call.errno,
            format_args!("{msg} expected {errnos}"),
        );
    }

    Outcome::new(false, call)
}

pub fn fail<T>(
    ctx: &impl Report,
    location: SourceLocation,
    msg: impl Display,
    call: CapturedCall<T>,
    errnos: &ErrnoSet<'_>,
    success: Success,
) -> Outcome<T> {
    let outcome = fail_silent(ctx, location.clone(), &msg, call, errnos, success);
    if outcome.passed {
        ctx.reporter()
            .report(ResultKind::Pass.with_errno(outcome.errno), location, msg);
    }

    outcome
}

/// Expect a failure with `errno` if given, a file descriptor otherwise.
pub fn fd_or_fail<T>(
    ctx: &impl Report,
    location: SourceLocation,
    msg: impl Display,
    call: CapturedCall<T>,
    errno: Option<Errno>,
) -> Outcome<T> {
    match errno {
        Some(errno) => fail(
            ctx,
            location,
            msg,
            call,
            &ErrnoSet::from(errno),
            Success::NonNegative,
        ),
        None => fd(ctx, location, msg, call),
    }
}

/// Expect a pointer other than `sentinel`.
pub fn pass_ptr_silent<T>(
    ctx: &impl Report,
    location: SourceLocation,
    msg: impl Display,
    call: CapturedCall<T>,
    sentinel: FailPtr,
) -> Outcome<T> {
    if sentinel.matches(call.ret) {
        report_fail(ctx, location, call.errno, format_args!("{msg} failed"));
        return Outcome::new(false, call);
    }

    Outcome::new(true, call)
}

pub fn pass_ptr<T>(
    ctx: &impl Report,
    location: SourceLocation,
    msg: impl Display,
    call: CapturedCall<T>,
    sentinel: FailPtr,
) -> Outcome<T> {
    let outcome = pass_ptr_silent(ctx, location.clone(), &msg, call, sentinel);
    if outcome.passed {
        report_pass(ctx, location, format_args!("{msg} passed"));
    }

    outcome
}

/// Expect `sentinel` with one of `errnos`.
pub fn fail_ptr_silent<T>(
    ctx: &impl Report,
    location: SourceLocation,
    msg: impl Display,
    call: CapturedCall<T>,
    sentinel: FailPtr,
    errnos: &ErrnoSet<'_>,
) -> Outcome<T> {
    if !sentinel.matches(call.ret) {
        ctx.reporter()
            .report(ResultKind::Fail, location, format_args!("{msg} succeeded"));
    } else if !errnos.contains(call.errno) {
        report_fail(
            ctx,
            location,
            call.errno,
            format_args!("{msg} expected {errnos}"),
        );
    } else {
        return Outcome::new(true, call);
    }

    Outcome::new(false, call)
}

pub fn fail_ptr<T>(
    ctx: &impl Report,
    location: SourceLocation,
    msg: impl Display,
    call: CapturedCall<T>,
    sentinel: FailPtr,
    errnos: &ErrnoSet<'_>,
) -> Outcome<T> {
    let outcome = fail_ptr_silent(ctx, location.clone(), &msg, call, sentinel, errnos);
    if outcome.passed {
        ctx.reporter()
            .report(ResultKind::Pass.with_errno(outcome.errno), location, msg);
    }

    outcome
}

/// Report whether a boolean expression holds.
pub fn expr(ctx: &impl Report, location: SourceLocation, holds: bool, msg: impl Display) -> bool {
    let kind = if holds {
        ResultKind::Pass
    } else {
        ResultKind::Fail
    };
    ctx.reporter()
        .report(kind, location, format_args!("Expect: {msg}"));

    holds
}

/// Expect `a == b`, `a_expr` and `b_expr` being how they were written.
pub fn eq_silent<A, B>(
    ctx: &impl Report,
    location: SourceLocation,
    a: &A,
    a_expr: &str,
    b: &B,
    b_expr: &str,
) -> bool
where
    A: PartialEq<B> + Display + ?Sized,
    B: Display + ?Sized,
{
    if a != b {
        ctx.reporter().report(
            ResultKind::Fail,
            location,
            format_args!("{a_expr} ({a}) != {b_expr} ({b})"),
        );
        return false;
    }

    true
}

pub fn eq<A, B>(
    ctx: &impl Report,
    location: SourceLocation,
    a: &A,
    a_expr: &str,
    b: &B,
    b_expr: &str,
) -> bool
where
    A: PartialEq<B> + Display + ?Sized,
    B: Display + ?Sized,
{
    let passed = eq_silent(ctx, location.clone(), a, a_expr, b, b_expr);
    if passed {
        report_pass(ctx, location, format_args!("{a_expr} == {b_expr} ({a})"));
    }

    passed
}

/// Expect two strings to be byte-wise equal.
pub fn eq_str(
    ctx: &impl Report,
    location: SourceLocation,
    a: &str,
    a_expr: &str,
    b: &str,
    b_expr: &str,
) -> bool {
    if a.as_bytes() == b.as_bytes() {
        report_pass(ctx, location, format_args!("{a_expr} == {b_expr} ({b})"));
        true
    } else {
        ctx.reporter().report(
            ResultKind::Fail,
            location,
            format_args!("{a_expr} ({a}) != {b_expr} ({b})"),
        );
        false
    }
}

/// Up to `len` leading bytes of `s`, which is what `strncmp` looks at.
fn prefix(s: &str, len: usize) -> &[u8] {
    &s.as_bytes()[..s.len().min(len)]
}

/// Expect the first `len` bytes of two strings to be equal.
///
/// A string shorter than `len` only equals another one of the same length.
pub fn eq_strn(
    ctx: &impl Report,
    location: SourceLocation,
    a: &str,
    a_expr: &str,
    b: &str,
    b_expr: &str,
    len: usize,
) -> bool {
    let (a, b) = (prefix(a, len), prefix(b, len));
    let shown_a = String::from_utf8_lossy(a);

    if a == b {
        report_pass(ctx, location, format_args!("{a_expr} == {b_expr} ({shown_a})"));
        true
    } else {
        let shown_b = String::from_utf8_lossy(b);
        ctx.reporter().report(
            ResultKind::Fail,
            location,
            format_args!("{a_expr} ({shown_a}) != {b_expr} ({shown_b})"),
        );
        false
    }
}
