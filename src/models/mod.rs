pub mod account;
pub mod booking;
pub mod payment;
pub mod seat;

pub use account::{Account, AccountRole};
pub use booking::{Booking, BookingStatus};
pub use payment::{Payment, PaymentMethod, PaymentStatus};
pub use seat::{Seat, SeatClass, SeatStatus, ShowSeat};
